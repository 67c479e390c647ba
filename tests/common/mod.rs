//! Shared harness: a local identity provider serving keys and tokens.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use auth_broker::config::Config;
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

pub const TEST_KEY_PEM: &[u8] = include_bytes!("../fixtures/test_rsa_private.pem");
pub const OTHER_KEY_PEM: &[u8] = include_bytes!("../fixtures/other_rsa_private.pem");
pub const JWKS: &str = include_str!("../fixtures/jwks.json");

pub const AUDIENCE: &str = "api://auth-broker";
pub const ADMIN_TENANT: &str = "admin-tenant";
pub const MEMBER_TENANT: &str = "member-tenant";

#[derive(Clone, Default)]
struct Counters {
    jwks: Arc<AtomicUsize>,
    token: Arc<AtomicUsize>,
}

/// A running mock identity provider.
pub struct MockIdp {
    pub base: String,
    counters: Counters,
}

impl MockIdp {
    /// Issuer URL for `tenant` (matches the default endpoint layout).
    pub fn issuer(&self, tenant: &str) -> String {
        format!("{}/{tenant}/v2.0", self.base)
    }

    pub fn jwks_hits(&self) -> usize {
        self.counters.jwks.load(Ordering::SeqCst)
    }

    pub fn token_hits(&self) -> usize {
        self.counters.token.load(Ordering::SeqCst)
    }
}

async fn jwks_handler(State(counters): State<Counters>) -> Json<Value> {
    counters.jwks.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::from_str(JWKS).unwrap())
}

async fn token_handler(State(counters): State<Counters>, body: String) -> Json<Value> {
    counters.token.fetch_add(1, Ordering::SeqCst);
    let form: Vec<(String, String)> = serde_urlencoded::from_str(&body).unwrap();
    let scope = form
        .iter()
        .find(|(k, _)| k == "scope")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    Json(json!({
        "access_token": "downstream-token",
        "token_type": "Bearer",
        "expires_in": 1800,
        "scope": scope,
    }))
}

/// Start the mock provider on an ephemeral port.
pub async fn spawn_idp() -> MockIdp {
    let counters = Counters::default();
    let app = Router::new()
        .route("/{tenant}/discovery/v2.0/keys", get(jwks_handler))
        .route("/{tenant}/oauth2/v2.0/token", post(token_handler))
        .with_state(counters.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    MockIdp {
        base: format!("http://{addr}"),
        counters,
    }
}

/// Broker configuration pointing both providers at `idp`.
pub fn config(idp: &MockIdp) -> Config {
    let mut config = Config::default();
    config.broker.require_https = false;
    config.broker.auto_provision_domains = vec!["corp.example.com".to_string()];
    config.providers.admin.issuer = idp.issuer(ADMIN_TENANT);
    config.providers.admin.audience = AUDIENCE.to_string();
    config.providers.member.issuer = idp.issuer(MEMBER_TENANT);
    config.providers.member.audience = AUDIENCE.to_string();
    config.validate().unwrap();
    config
}

/// Same as [`config`] with on-behalf-of exchange enabled.
pub fn config_with_delegation(idp: &MockIdp) -> Config {
    let mut config = config(idp);
    config.delegation.enabled = true;
    config.delegation.client_id = "broker-client".to_string();
    config.delegation.client_secret = Some("broker-secret".to_string());
    config.delegation.default_scopes = vec!["api://downstream/.default".to_string()];
    config.validate().unwrap();
    config
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn claims(issuer: &str, email: &str) -> Value {
    json!({
        "iss": issuer,
        "sub": format!("sub-{email}"),
        "aud": AUDIENCE,
        "exp": now() + 3600,
        "iat": now(),
        "nbf": now(),
        "email": email,
        "name": "Integration User",
    })
}

pub fn sign(claims: &Value) -> String {
    sign_with(claims, "test-key-1", TEST_KEY_PEM)
}

pub fn sign_with(claims: &Value, kid: &str, pem: &[u8]) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_rsa_pem(pem).unwrap()).unwrap()
}

/// Base64 proxy principal descriptor.
pub fn proxy_assertion(provider: &str, email: &str, roles: &[&str]) -> String {
    STANDARD.encode(
        serde_json::to_vec(&json!({
            "identityProvider": provider,
            "userId": format!("user-{email}"),
            "userDetails": email,
            "userRoles": roles,
        }))
        .unwrap(),
    )
}
