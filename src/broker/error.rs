//! Authorization error taxonomy.
//!
//! Every variant is terminal for the current request and fails closed: a
//! caller holding an [`AuthError`] must treat the request as not authorized.

use axum::http::StatusCode;
use broker_core::{IdentityProvider, Surface};
use serde::Serialize;

/// Why an authorization decision or delegated exchange failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The proxy assertion header could not be decoded.
    #[error("malformed identity assertion: {0}")]
    MalformedAssertion(String),

    /// The bearer token is not a well-formed JWT.
    #[error("malformed bearer token: {0}")]
    MalformedToken(String),

    /// The JWT header names an algorithm outside the asymmetric allow-list.
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No key with the token's `kid` exists in the provider's key set.
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    /// The provider's key set could not be fetched and no fresh copy is cached.
    #[error("signing key set unavailable: {0}")]
    KeySetUnavailable(String),

    /// Signature verification failed.
    #[error("invalid token signature")]
    InvalidSignature,

    /// `exp` is not in the future.
    #[error("token expired")]
    TokenExpired,

    /// `nbf` or `iat` lies beyond the clock-skew tolerance.
    #[error("token not yet valid")]
    TokenNotYetValid,

    /// `iss` does not match a configured provider.
    #[error("issuer mismatch: {0}")]
    IssuerMismatch(String),

    /// `aud` does not contain the expected audience.
    #[error("audience mismatch")]
    AudienceMismatch,

    /// The authenticating provider may not reach the requested surface.
    #[error("identity provider {provider} may not access the {surface} surface")]
    ProviderMismatch {
        /// Provider that authenticated the caller.
        provider: IdentityProvider,
        /// Surface the request targeted.
        surface: Surface,
    },

    /// The Directory Store could not be reached.
    #[error("directory store unavailable: {0}")]
    DirectoryStoreUnavailable(String),

    /// The provider requires interactive user consent for the downstream scope.
    #[error("user consent required: {0}")]
    ConsentRequired(String),

    /// The caller's token was rejected by the token endpoint.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// The service's own client credential was rejected.
    #[error("service credential rejected: {0}")]
    ServiceCredentialRejected(String),

    /// The token endpoint failed, timed out, or could not be reached.
    #[error("token endpoint unavailable: {0}")]
    TokenEndpointUnavailable(String),
}

/// Stable, serializable name of an [`AuthError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`AuthError::MalformedAssertion`].
    MalformedAssertion,
    /// See [`AuthError::MalformedToken`].
    MalformedToken,
    /// See [`AuthError::UnsupportedAlgorithm`].
    UnsupportedAlgorithm,
    /// See [`AuthError::UnknownSigningKey`].
    UnknownSigningKey,
    /// See [`AuthError::KeySetUnavailable`].
    KeySetUnavailable,
    /// See [`AuthError::InvalidSignature`].
    InvalidSignature,
    /// See [`AuthError::TokenExpired`].
    TokenExpired,
    /// See [`AuthError::TokenNotYetValid`].
    TokenNotYetValid,
    /// See [`AuthError::IssuerMismatch`].
    IssuerMismatch,
    /// See [`AuthError::AudienceMismatch`].
    AudienceMismatch,
    /// See [`AuthError::ProviderMismatch`].
    ProviderMismatch,
    /// See [`AuthError::DirectoryStoreUnavailable`].
    DirectoryStoreUnavailable,
    /// See [`AuthError::ConsentRequired`].
    ConsentRequired,
    /// See [`AuthError::InvalidGrant`].
    InvalidGrant,
    /// See [`AuthError::ServiceCredentialRejected`].
    ServiceCredentialRejected,
    /// See [`AuthError::TokenEndpointUnavailable`].
    TokenEndpointUnavailable,
}

impl ErrorKind {
    /// `snake_case` code used in JSON error bodies and audit events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedAssertion => "malformed_assertion",
            Self::MalformedToken => "malformed_token",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::UnknownSigningKey => "unknown_signing_key",
            Self::KeySetUnavailable => "key_set_unavailable",
            Self::InvalidSignature => "invalid_signature",
            Self::TokenExpired => "token_expired",
            Self::TokenNotYetValid => "token_not_yet_valid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::ProviderMismatch => "provider_mismatch",
            Self::DirectoryStoreUnavailable => "directory_store_unavailable",
            Self::ConsentRequired => "consent_required",
            Self::InvalidGrant => "invalid_grant",
            Self::ServiceCredentialRejected => "service_credential_rejected",
            Self::TokenEndpointUnavailable => "token_endpoint_unavailable",
        }
    }
}

impl AuthError {
    /// The variant's [`ErrorKind`].
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedAssertion(_) => ErrorKind::MalformedAssertion,
            Self::MalformedToken(_) => ErrorKind::MalformedToken,
            Self::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            Self::UnknownSigningKey(_) => ErrorKind::UnknownSigningKey,
            Self::KeySetUnavailable(_) => ErrorKind::KeySetUnavailable,
            Self::InvalidSignature => ErrorKind::InvalidSignature,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::TokenNotYetValid => ErrorKind::TokenNotYetValid,
            Self::IssuerMismatch(_) => ErrorKind::IssuerMismatch,
            Self::AudienceMismatch => ErrorKind::AudienceMismatch,
            Self::ProviderMismatch { .. } => ErrorKind::ProviderMismatch,
            Self::DirectoryStoreUnavailable(_) => ErrorKind::DirectoryStoreUnavailable,
            Self::ConsentRequired(_) => ErrorKind::ConsentRequired,
            Self::InvalidGrant(_) => ErrorKind::InvalidGrant,
            Self::ServiceCredentialRejected(_) => ErrorKind::ServiceCredentialRejected,
            Self::TokenEndpointUnavailable(_) => ErrorKind::TokenEndpointUnavailable,
        }
    }

    /// HTTP status a handler should answer with.
    ///
    /// 401 = not authenticated, 403 = authenticated but forbidden,
    /// 503 = infrastructure failure rather than a denial.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ProviderMismatch { .. } | Self::ConsentRequired(_) => StatusCode::FORBIDDEN,
            Self::KeySetUnavailable(_)
            | Self::DirectoryStoreUnavailable(_)
            | Self::TokenEndpointUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceCredentialRejected(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Whether a caller-side retry could succeed without any change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.status_code() == StatusCode::SERVICE_UNAVAILABLE
    }
}
