//! Per-surface authorization middleware.
//!
//! Each protected route group gets its own [`SurfaceGuard`]. On success the
//! request carries an [`Authorized`] and its [`AuthContext`] as extensions;
//! on failure the middleware answers directly and the handler never runs.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use broker_core::Surface;
use serde_json::json;
use tracing::{debug, warn};

use crate::broker::{AuthContext, Authorized, Broker, Denial};

/// Middleware state: the broker plus the surface being guarded.
#[derive(Clone)]
pub struct SurfaceGuard {
    /// Shared broker
    pub broker: Arc<Broker>,
    /// Surface this guard protects
    pub surface: Surface,
}

impl SurfaceGuard {
    /// Guard `surface` with `broker`.
    #[must_use]
    pub fn new(broker: Arc<Broker>, surface: Surface) -> Self {
        Self { broker, surface }
    }
}

/// Authorization middleware
pub async fn auth_middleware(
    State(guard): State<SurfaceGuard>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match guard
        .broker
        .authorize_headers(request.headers(), guard.surface)
        .await
    {
        Ok(Some(authorized)) => {
            debug!(
                path = %path,
                surface = %guard.surface,
                email = %authorized.principal.email,
                is_admin = authorized.is_admin(),
                "Authorized request"
            );
            request.extensions_mut().insert(authorized.context());
            request.extensions_mut().insert(authorized);
            next.run(request).await
        }
        Ok(None) => {
            warn!(path = %path, surface = %guard.surface, "Missing credentials");
            unauthenticated_response()
        }
        Err(denial) => {
            warn!(
                path = %path,
                surface = %guard.surface,
                error = denial.code(),
                "Request denied"
            );
            denial_response(&denial)
        }
    }
}

/// Require the admin flag on an already-authorized request.
pub fn require_admin(authorized: &Authorized) -> Result<(), Response> {
    if authorized.is_admin() {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::FORBIDDEN,
            "admin_required",
            "this operation requires the admin role",
        ))
    }
}

/// 401 for requests that presented no identity at all.
fn unauthenticated_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "error": "unauthenticated",
            "message": "No credentials presented. Use: Authorization: Bearer <token>",
            "context": AuthContext::anonymous(),
        })),
    )
        .into_response()
}

/// Map a [`Denial`] to its status and JSON body.
pub fn denial_response(denial: &Denial) -> Response {
    let status = denial.status_code();
    let body = Json(json!({
        "error": denial.code(),
        "message": denial.message(),
        "context": denial.context(),
    }));

    if status == StatusCode::UNAUTHORIZED {
        let challenge = format!("Bearer error=\"invalid_token\", error_description=\"{}\"", denial.code());
        (status, [(header::WWW_AUTHENTICATE, challenge)], body).into_response()
    } else {
        (status, body).into_response()
    }
}

/// `{"error", "message"}` body with `status`.
pub fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}
