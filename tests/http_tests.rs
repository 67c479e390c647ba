//! HTTP surface tests
//!
//! Sends requests through the full router (middleware, handlers, layers)
//! without binding a socket for the broker itself.

mod common;

use std::sync::Arc;
use std::time::Duration;

use auth_broker::broker::Broker;
use auth_broker::config::Config;
use auth_broker::gateway::create_router;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use common::{ADMIN_TENANT, MEMBER_TENANT, MockIdp};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

const PROXY_HEADER: &str = "x-ms-client-principal";

async fn app(config: &Config) -> Router {
    let broker = Broker::from_config(config).await.unwrap();
    create_router(Arc::new(broker), Duration::from_secs(5))
}

fn admin_token(idp: &MockIdp, email: &str) -> String {
    common::sign(&common::claims(&idp.issuer(ADMIN_TENANT), email))
}

fn member_token(idp: &MockIdp, email: &str) -> String {
    common::sign(&common::claims(&idp.issuer(MEMBER_TENANT), email))
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn health_is_public() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;

    let (status, body) = send(&app, request(Method::GET, "/health", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["delegation"], false);
}

#[tokio::test]
async fn anonymous_request_gets_401_with_challenge() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/api/me", None, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
}

#[tokio::test]
async fn member_me_returns_auth_context() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;
    let token = member_token(&idp, "ana@example.org");

    let (status, body) = send(&app, request(Method::GET, "/api/me", Some(&token), None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isAuthenticated"], true);
    assert_eq!(body["isAdmin"], false);
    assert_eq!(body["principal"]["email"], "ana@example.org");
    assert_eq!(body["principal"]["issuingProvider"], "member-idp");
}

#[tokio::test]
async fn proxy_assertion_header_is_accepted() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;
    let assertion = common::proxy_assertion("admin-idp", "lead@corp.example.com", &["authenticated"]);

    let req = Request::builder()
        .uri("/api/admin/me")
        .header(PROXY_HEADER, assertion)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isAdmin"], true);
}

#[tokio::test]
async fn member_token_on_admin_surface_is_403() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;
    let token = member_token(&idp, "bob@external.com");

    let (status, body) = send(&app, request(Method::GET, "/api/admin/me", Some(&token), None)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "provider_mismatch");
    assert_eq!(body["context"]["isAuthenticated"], false);
}

#[tokio::test]
async fn garbage_token_is_401_invalid_token() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/api/me", Some("not.a-real.token"), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
    assert!(challenge.starts_with("Bearer error=\"invalid_token\""));
}

#[tokio::test]
async fn admin_manages_user_records() {
    // GIVEN: an auto-provisioned admin
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;
    let admin = admin_token(&idp, "lead@corp.example.com");

    // WHEN: granting a role to a partner, suspending, reading, reactivating
    let (status, granted) = send(
        &app,
        request(
            Method::POST,
            "/api/admin/users/partner@partner.example/roles",
            Some(&admin),
            Some(json!({"role": "billing"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(granted["roles"], json!(["billing"]));

    let (status, suspended) = send(
        &app,
        request(Method::POST, "/api/admin/users/partner@partner.example/suspend", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(suspended["status"], "suspended");

    let (status, fetched) = send(
        &app,
        request(Method::GET, "/api/admin/users/partner@partner.example", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "suspended");

    let (status, reactivated) = send(
        &app,
        request(Method::POST, "/api/admin/users/partner@partner.example/reactivate", Some(&admin), None),
    )
    .await;

    // THEN
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reactivated["status"], "active");
    assert_eq!(reactivated["roles"], json!(["billing"]));

    let (status, revoked) = send(
        &app,
        request(
            Method::DELETE,
            "/api/admin/users/partner@partner.example/roles/billing",
            Some(&admin),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revoked["roles"], json!([]));
}

#[tokio::test]
async fn non_admin_cannot_manage_users() {
    // GIVEN: an admin-provider caller outside the provisioning domain
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;
    let token = admin_token(&idp, "viewer@outside.example");

    let (status, body) = send(
        &app,
        request(Method::POST, "/api/admin/users/victim@corp.example.com/suspend", Some(&token), None),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "admin_required");
}

#[tokio::test]
async fn unknown_user_is_404() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;
    let admin = admin_token(&idp, "lead@corp.example.com");

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/admin/users/nobody@partner.example", Some(&admin), None),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn delegate_is_404_when_not_configured() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config(&idp)).await;
    let token = member_token(&idp, "ana@example.org");

    let (status, body) = send(&app, request(Method::POST, "/api/delegate", Some(&token), None)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "delegation_disabled");
}

#[tokio::test]
async fn delegate_returns_downstream_token() {
    let idp = common::spawn_idp().await;
    let app = app(&common::config_with_delegation(&idp)).await;
    let token = member_token(&idp, "ana@example.org");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/delegate",
            Some(&token),
            Some(json!({"scopes": ["api://downstream/read"]})),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accessToken"], "downstream-token");
    assert_eq!(body["tokenType"], "Bearer");
    assert_eq!(body["scopes"], json!(["api://downstream/read"]));
    assert_eq!(idp.token_hits(), 1);
}
