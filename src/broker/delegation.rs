//! On-behalf-of token exchange.
//!
//! A verified caller token is traded at the issuing provider's token
//! endpoint for a token scoped to a downstream API. Results are never
//! cached; every call is one POST bounded by the configured timeout.

use std::fmt;

use broker_core::IdentityProvider;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::AuthError;
use super::validator::VerifiedToken;
use crate::config::{DelegationConfig, ProvidersConfig};
use crate::{Error, Result};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Longest provider error description carried into an [`AuthError`].
const MAX_DESCRIPTION_LEN: usize = 200;

/// A downstream access token obtained on the caller's behalf.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedToken {
    /// The downstream access token.
    pub access_token: String,
    /// Usually `Bearer`.
    pub token_type: String,
    /// Expiry computed from `expires_in`.
    pub expires_at: DateTime<Utc>,
    /// Granted scopes.
    pub scopes: Vec<String>,
}

impl fmt::Debug for DelegatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Successful token endpoint response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<ExpiresIn>,
    scope: Option<String>,
}

/// Some endpoints send `expires_in` as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(i64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> Option<i64> {
        match self {
            Self::Seconds(s) => Some(*s),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Error response body (RFC 6749 §5.2 plus provider extensions).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenErrorBody {
    error: String,
    error_description: Option<String>,
    suberror: Option<String>,
    error_codes: Vec<u64>,
}

impl TokenErrorBody {
    fn has_code(&self, code: u64) -> bool {
        self.error_codes.contains(&code)
            || self
                .error_description
                .as_deref()
                .is_some_and(|d| d.contains(&format!("AADSTS{code}")))
    }

    fn summary(&self) -> String {
        let text = self
            .error_description
            .as_deref()
            .and_then(|d| d.lines().next())
            .filter(|line| !line.trim().is_empty())
            .unwrap_or(self.error.as_str());
        let mut summary: String = text.chars().take(MAX_DESCRIPTION_LEN).collect();
        if summary.is_empty() {
            summary = "token endpoint rejected the request".to_string();
        }
        summary
    }

    fn classify(&self) -> AuthError {
        let summary = self.summary();
        if matches!(self.error.as_str(), "consent_required" | "interaction_required")
            || self.suberror.as_deref() == Some("consent_required")
            || self.has_code(65001)
        {
            AuthError::ConsentRequired(summary)
        } else if matches!(self.error.as_str(), "invalid_client" | "unauthorized_client")
            || self.has_code(7_000_215)
            || self.has_code(7_000_222)
        {
            AuthError::ServiceCredentialRejected(summary)
        } else {
            AuthError::InvalidGrant(summary)
        }
    }
}

/// Performs the jwt-bearer on-behalf-of grant.
pub struct DelegatedTokenExchanger {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    default_scopes: Vec<String>,
    endpoints: Vec<(IdentityProvider, String)>,
}

impl DelegatedTokenExchanger {
    /// Build from configuration. Fails if no client secret resolves.
    pub fn new(
        delegation: &DelegationConfig,
        providers: &ProvidersConfig,
        require_https: bool,
    ) -> Result<Self> {
        let client_secret = delegation
            .resolve_client_secret()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("delegation.client_secret is not set".to_string()))?;

        let http = reqwest::Client::builder()
            .https_only(require_https)
            .timeout(delegation.timeout)
            .build()?;

        let endpoints = IdentityProvider::ALL
            .into_iter()
            .map(|provider| (provider, providers.get(provider).resolved_token_endpoint()))
            .collect();

        Ok(Self {
            http,
            client_id: delegation.client_id.clone(),
            client_secret,
            default_scopes: delegation.default_scopes.clone(),
            endpoints,
        })
    }

    /// Scopes used when a caller requests none.
    #[must_use]
    pub fn default_scopes(&self) -> &[String] {
        &self.default_scopes
    }

    /// Token endpoint for `provider`.
    #[must_use]
    pub fn token_endpoint(&self, provider: IdentityProvider) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|(p, _)| *p == provider)
            .map(|(_, endpoint)| endpoint.as_str())
    }

    /// Exchange `token` for a downstream token carrying `scopes`
    /// (the default scopes when empty).
    pub async fn exchange(
        &self,
        token: &VerifiedToken,
        scopes: &[String],
    ) -> std::result::Result<DelegatedToken, AuthError> {
        let scopes = if scopes.is_empty() { self.default_scopes.as_slice() } else { scopes };
        if scopes.is_empty() {
            return Err(AuthError::InvalidGrant("no downstream scope requested".to_string()));
        }

        let provider = token.principal().issuing_provider;
        let endpoint = self.token_endpoint(provider).ok_or_else(|| {
            AuthError::TokenEndpointUnavailable(format!("no token endpoint for {provider}"))
        })?;
        let scope = scopes.join(" ");

        debug!(provider = %provider, endpoint = %endpoint, scope = %scope, "Requesting on-behalf-of token");

        let params = [
            ("grant_type", JWT_BEARER_GRANT),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("assertion", token.raw()),
            ("requested_token_use", "on_behalf_of"),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http
            .post(endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %provider, error = %e, "Token endpoint request failed");
                AuthError::TokenEndpointUnavailable(if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    "request failed".to_string()
                })
            })?;

        let status = response.status();
        if status.is_server_error() {
            warn!(provider = %provider, status = %status, "Token endpoint server error");
            return Err(AuthError::TokenEndpointUnavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body: TokenErrorBody = response.json().await.unwrap_or_default();
            let err = body.classify();
            debug!(provider = %provider, status = %status, error = %body.error, kind = err.kind().as_str(), "Token endpoint rejected exchange");
            return Err(err);
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            warn!(provider = %provider, error = %e, "Malformed token endpoint response");
            AuthError::TokenEndpointUnavailable("malformed token response".to_string())
        })?;

        let expires_in = parsed
            .expires_in
            .as_ref()
            .and_then(ExpiresIn::seconds)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = expiry_from(Utc::now(), expires_in).ok_or_else(|| {
            warn!(provider = %provider, expires_in, "Token endpoint returned an unusable expires_in");
            AuthError::TokenEndpointUnavailable("malformed token response".to_string())
        })?;
        let granted = parsed
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| scopes.to_vec());

        Ok(DelegatedToken {
            access_token: parsed.access_token,
            token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            scopes: granted,
        })
    }
}

/// `now + expires_in`, or `None` for a non-positive or out-of-range lifetime.
fn expiry_from(now: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    if expires_in <= 0 {
        return None;
    }
    now.checked_add_signed(ChronoDuration::try_seconds(expires_in)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::principal::PrincipalDecoder;
    use crate::broker::testing::{self, MEMBER_ISSUER};
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone)]
    struct Endpoint {
        status: StatusCode,
        body: Value,
        delay: Duration,
        seen: Arc<parking_lot::Mutex<Vec<HashMap<String, String>>>>,
    }

    async fn token_handler(State(ep): State<Endpoint>, body: String) -> impl IntoResponse {
        let form: HashMap<String, String> = serde_urlencoded::from_str(&body).unwrap();
        ep.seen.lock().push(form);
        tokio::time::sleep(ep.delay).await;
        (ep.status, axum::Json(ep.body.clone()))
    }

    async fn spawn_endpoint(ep: Endpoint) -> String {
        let app = Router::new().route("/token", post(token_handler)).with_state(ep);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/token")
    }

    fn endpoint(status: StatusCode, body: Value) -> Endpoint {
        Endpoint {
            status,
            body,
            delay: Duration::ZERO,
            seen: Arc::default(),
        }
    }

    fn exchanger(token_endpoint: String, timeout: Duration) -> DelegatedTokenExchanger {
        let mut config = testing::config();
        config.providers.member.token_endpoint = Some(token_endpoint);
        config.delegation.enabled = true;
        config.delegation.client_id = "broker-client".to_string();
        config.delegation.client_secret = Some("s3cret".to_string());
        config.delegation.default_scopes = vec!["api://downstream/.default".to_string()];
        config.delegation.timeout = timeout;
        DelegatedTokenExchanger::new(&config.delegation, &config.providers, false).unwrap()
    }

    async fn verified_member_token() -> VerifiedToken {
        let raw = testing::sign(&testing::claims(MEMBER_ISSUER, "ana@example.org"));
        let decoded = PrincipalDecoder::decode_bearer(&raw).unwrap();
        testing::validator().validate(&decoded).await.unwrap()
    }

    #[tokio::test]
    async fn successful_exchange_posts_obo_form() {
        // GIVEN: a token endpoint that grants
        let ep = endpoint(
            StatusCode::OK,
            json!({
                "access_token": "downstream-token",
                "token_type": "Bearer",
                "expires_in": 3599,
                "scope": "api://downstream/read"
            }),
        );
        let seen = Arc::clone(&ep.seen);
        let url = spawn_endpoint(ep).await;
        let token = verified_member_token().await;

        // WHEN: exchanging with default scopes
        let delegated = exchanger(url, Duration::from_secs(5))
            .exchange(&token, &[])
            .await
            .unwrap();

        // THEN: the OBO form was sent and the response mapped
        assert_eq!(delegated.access_token, "downstream-token");
        assert_eq!(delegated.scopes, vec!["api://downstream/read"]);
        assert!(delegated.expires_at > Utc::now() + ChronoDuration::seconds(3500));

        let form = seen.lock()[0].clone();
        assert_eq!(form["grant_type"], JWT_BEARER_GRANT);
        assert_eq!(form["requested_token_use"], "on_behalf_of");
        assert_eq!(form["client_id"], "broker-client");
        assert_eq!(form["client_secret"], "s3cret");
        assert_eq!(form["assertion"], token.raw());
        assert_eq!(form["scope"], "api://downstream/.default");
    }

    #[tokio::test]
    async fn string_expires_in_is_accepted() {
        let url = spawn_endpoint(endpoint(
            StatusCode::OK,
            json!({"access_token": "t", "expires_in": "60"}),
        ))
        .await;
        let token = verified_member_token().await;

        let delegated = exchanger(url, Duration::from_secs(5))
            .exchange(&token, &["api://x/read".to_string()])
            .await
            .unwrap();

        assert_eq!(delegated.token_type, "Bearer");
        assert_eq!(delegated.scopes, vec!["api://x/read"]);
        assert!(delegated.expires_at < Utc::now() + ChronoDuration::seconds(61));
    }

    #[tokio::test]
    async fn consent_errors_are_distinguished() {
        for body in [
            json!({"error": "invalid_grant", "suberror": "consent_required", "error_description": "AADSTS65001: The user has not consented."}),
            json!({"error": "interaction_required", "error_description": "MFA needed"}),
            json!({"error": "invalid_grant", "error_codes": [65001]}),
        ] {
            let url = spawn_endpoint(endpoint(StatusCode::BAD_REQUEST, body)).await;
            let token = verified_member_token().await;

            let err = exchanger(url, Duration::from_secs(5))
                .exchange(&token, &[])
                .await
                .unwrap_err();

            assert!(matches!(err, AuthError::ConsentRequired(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn rejected_client_credential_is_service_fault() {
        let url = spawn_endpoint(endpoint(
            StatusCode::UNAUTHORIZED,
            json!({"error": "invalid_client", "error_description": "AADSTS7000215: Invalid client secret provided."}),
        ))
        .await;
        let token = verified_member_token().await;

        let err = exchanger(url, Duration::from_secs(5))
            .exchange(&token, &[])
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::ServiceCredentialRejected(ref m) if m.contains("AADSTS7000215")));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn other_client_errors_are_invalid_grant() {
        let url = spawn_endpoint(endpoint(
            StatusCode::BAD_REQUEST,
            json!({"error": "invalid_grant", "error_description": "AADSTS50013: Assertion failed signature validation."}),
        ))
        .await;
        let token = verified_member_token().await;

        let err = exchanger(url, Duration::from_secs(5))
            .exchange(&token, &[])
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn server_errors_and_timeouts_are_unavailable() {
        let token = verified_member_token().await;

        let url = spawn_endpoint(endpoint(StatusCode::BAD_GATEWAY, json!({}))).await;
        let err = exchanger(url, Duration::from_secs(5)).exchange(&token, &[]).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenEndpointUnavailable(_)));

        let mut slow = endpoint(StatusCode::OK, json!({"access_token": "late"}));
        slow.delay = Duration::from_millis(500);
        let url = spawn_endpoint(slow).await;
        let err = exchanger(url, Duration::from_millis(50)).exchange(&token, &[]).await.unwrap_err();
        assert_eq!(err, AuthError::TokenEndpointUnavailable("request timed out".to_string()));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let token = verified_member_token().await;

        let err = exchanger("http://127.0.0.1:1/token".to_string(), Duration::from_secs(2))
            .exchange(&token, &[])
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[test]
    fn missing_secret_is_a_config_error() {
        let config = testing::config();
        assert!(matches!(
            DelegatedTokenExchanger::new(&config.delegation, &config.providers, true),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn debug_redacts_access_token() {
        let token = DelegatedToken {
            access_token: "very-secret".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now(),
            scopes: vec![],
        };
        assert!(!format!("{token:?}").contains("very-secret"));
    }

    #[test]
    fn unparseable_error_body_defaults_to_invalid_grant() {
        let body = TokenErrorBody::default();
        assert!(matches!(body.classify(), AuthError::InvalidGrant(_)));
    }
    #[tokio::test]
    async fn out_of_range_expires_in_is_rejected() {
        for expires_in in [json!(100_000_000_000_000_i64), json!(i64::MAX), json!(0), json!(-5)] {
            // GIVEN: a grant whose lifetime cannot be represented
            let ep = endpoint(
                StatusCode::OK,
                json!({"access_token": "t", "expires_in": expires_in}),
            );
            let url = spawn_endpoint(ep).await;
            let token = verified_member_token().await;

            // WHEN
            let err = exchanger(url, Duration::from_secs(5))
                .exchange(&token, &[])
                .await
                .unwrap_err();

            // THEN: a malformed response, not a panic
            assert!(
                matches!(err, AuthError::TokenEndpointUnavailable(ref m) if m == "malformed token response"),
                "{expires_in}: {err:?}"
            );
        }
    }

    #[test]
    fn expiry_from_checks_range() {
        let now = Utc::now();
        assert_eq!(expiry_from(now, 60), Some(now + ChronoDuration::seconds(60)));
        assert!(expiry_from(now, 0).is_none());
        assert!(expiry_from(now, i64::MAX).is_none());
    }
}
