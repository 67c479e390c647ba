//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use broker_core::Surface;
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::auth::{SurfaceGuard, auth_middleware, error_response, require_admin};
use crate::broker::{AuthContext, Authorized, Broker, RecordChange, StoreError};

/// Shared application state
pub struct AppState {
    /// The authorization broker
    pub broker: Arc<Broker>,
}

/// Create the router
///
/// Member routes live under `/api`, admin routes under `/api/admin`; each
/// group is guarded for its own surface.
pub fn create_router(broker: Arc<Broker>, request_timeout: Duration) -> Router {
    let state = Arc::new(AppState {
        broker: Arc::clone(&broker),
    });

    let member = Router::new()
        .route("/api/me", get(me_handler))
        .route("/api/delegate", post(delegate_handler))
        .route_layer(middleware::from_fn_with_state(
            SurfaceGuard::new(Arc::clone(&broker), Surface::Member),
            auth_middleware,
        ));

    let admin = Router::new()
        .route("/api/admin/me", get(me_handler))
        .route("/api/admin/delegate", post(delegate_handler))
        .route("/api/admin/users/{email}", get(get_user_handler))
        .route("/api/admin/users/{email}/roles", post(grant_role_handler))
        .route(
            "/api/admin/users/{email}/roles/{role}",
            delete(revoke_role_handler),
        )
        .route("/api/admin/users/{email}/suspend", post(suspend_handler))
        .route(
            "/api/admin/users/{email}/reactivate",
            post(reactivate_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            SurfaceGuard::new(broker, Surface::Admin),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(member)
        .merge(admin)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "delegation": state.broker.delegation_enabled(),
    }))
}

/// The caller's authorization context
async fn me_handler(Extension(context): Extension<AuthContext>) -> Json<AuthContext> {
    Json(context)
}

#[derive(Debug, Default, Deserialize)]
struct DelegateRequest {
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GrantRoleRequest {
    role: String,
}

/// On-behalf-of exchange (POST /api/delegate, /api/admin/delegate)
///
/// The body is optional; without scopes the configured defaults apply.
async fn delegate_handler(
    State(state): State<Arc<AppState>>,
    Extension(authorized): Extension<Authorized>,
    body: Bytes,
) -> Response {
    if !state.broker.delegation_enabled() {
        return error_response(
            StatusCode::NOT_FOUND,
            "delegation_disabled",
            "on-behalf-of exchange is not configured",
        );
    }

    let request = if body.is_empty() {
        DelegateRequest::default()
    } else {
        match serde_json::from_slice::<DelegateRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("Invalid request body: {e}"),
                );
            }
        }
    };

    match state.broker.delegate(&authorized, &request.scopes).await {
        Ok(token) => Json(token).into_response(),
        Err(err) => {
            warn!(email = %authorized.principal.email, error = %err, "Delegation failed");
            error_response(err.status_code(), err.kind().as_str(), &err.to_string())
        }
    }
}

/// GET /api/admin/users/{email}
async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    Extension(authorized): Extension<Authorized>,
    Path(email): Path<String>,
) -> Response {
    if let Err(response) = require_admin(&authorized) {
        return response;
    }

    match state.broker.record(&email).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => store_error_response(&StoreError::NotFound(email)),
        Err(e) => store_error_response(&e),
    }
}

/// POST /api/admin/users/{email}/roles
async fn grant_role_handler(
    State(state): State<Arc<AppState>>,
    Extension(authorized): Extension<Authorized>,
    Path(email): Path<String>,
    body: Bytes,
) -> Response {
    let request = match serde_json::from_slice::<GrantRoleRequest>(&body) {
        Ok(request) if !request.role.trim().is_empty() => request,
        Ok(_) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", "role must not be empty");
        }
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("Invalid request body: {e}"),
            );
        }
    };

    change_record(
        &state,
        &authorized,
        &email,
        RecordChange::GrantRole(request.role.trim().to_string()),
    )
    .await
}

/// DELETE /api/admin/users/{email}/roles/{role}
async fn revoke_role_handler(
    State(state): State<Arc<AppState>>,
    Extension(authorized): Extension<Authorized>,
    Path((email, role)): Path<(String, String)>,
) -> Response {
    change_record(&state, &authorized, &email, RecordChange::RevokeRole(role)).await
}

/// POST /api/admin/users/{email}/suspend
async fn suspend_handler(
    State(state): State<Arc<AppState>>,
    Extension(authorized): Extension<Authorized>,
    Path(email): Path<String>,
) -> Response {
    change_record(&state, &authorized, &email, RecordChange::Suspend).await
}

/// POST /api/admin/users/{email}/reactivate
async fn reactivate_handler(
    State(state): State<Arc<AppState>>,
    Extension(authorized): Extension<Authorized>,
    Path(email): Path<String>,
) -> Response {
    change_record(&state, &authorized, &email, RecordChange::Reactivate).await
}

async fn change_record(
    state: &AppState,
    authorized: &Authorized,
    email: &str,
    change: RecordChange,
) -> Response {
    if let Err(response) = require_admin(authorized) {
        return response;
    }

    debug!(email = %email, change = ?change, "Applying record change");
    match state.broker.update_record(authorized, email, change).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => store_error_response(&e),
    }
}

fn store_error_response(err: &StoreError) -> Response {
    let (status, code) = match err {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        StoreError::Conflict(_) | StoreError::VersionConflict { .. } => (StatusCode::CONFLICT, "conflict"),
        StoreError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "directory_store_unavailable"),
    };
    error_response(status, code, &err.to_string())
}
