//! Inbound identity decoding.
//!
//! Two input shapes are accepted, modeled as [`AssertionInput`]:
//!
//! - **Proxy assertion**: a base64-encoded JSON principal descriptor set by
//!   the upstream reverse proxy (`identityProvider`, `userId`, `userDetails`,
//!   `userRoles`). Decoding yields a [`Principal`] at [`TrustLevel::Asserted`].
//! - **Bearer token**: a raw JWT. Decoding only splits and parses it into a
//!   [`DecodedToken`]; turning it into a principal is the validator's job.
//!
//! Nothing here performs I/O.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use broker_core::{IdentityProvider, Principal, TrustLevel, normalize_email};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::AuthError;
use crate::config::{BrokerConfig, ProvidersConfig};

/// Standard alphabet, padding optional (proxies differ).
const ASSERTION_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The identity material carried by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionInput {
    /// Raw value of the proxy assertion header.
    ProxyPrincipal(String),
    /// Raw JWT from `Authorization: Bearer`.
    BearerToken(String),
}

impl AssertionInput {
    /// Pick the request's identity input.
    ///
    /// A bearer token wins over the proxy header. Sources disabled in
    /// `config` are ignored; `None` means the request is anonymous.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, config: &BrokerConfig) -> Option<Self> {
        if config.accept_bearer_tokens {
            let bearer = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| {
                    v.strip_prefix("Bearer ")
                        .or_else(|| v.strip_prefix("bearer "))
                })
                .map(str::trim)
                .filter(|t| !t.is_empty());
            if let Some(token) = bearer {
                return Some(Self::BearerToken(token.to_string()));
            }
        }

        if config.trust_proxy_assertion {
            let assertion = headers
                .get(config.assertion_header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(raw) = assertion {
                return Some(Self::ProxyPrincipal(raw.to_string()));
            }
        }

        None
    }
}

/// Result of decoding an [`AssertionInput`].
#[derive(Debug, Clone)]
pub enum Decoded {
    /// Proxy-asserted principal; parsed, not verified.
    Asserted(Principal),
    /// Structurally valid JWT awaiting verification.
    Unverified(DecodedToken),
}

/// Proxy principal descriptor as sent on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyAssertion {
    identity_provider: String,
    #[serde(default)]
    user_id: Option<String>,
    user_details: String,
    #[serde(default)]
    user_roles: Vec<String>,
}

/// JOSE header fields the broker cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Signing algorithm name (`RS256`, ...).
    pub alg: String,
    /// Key id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Token type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "x"`
    One(String),
    /// `"aud": ["x", "y"]`
    Many(Vec<String>),
}

impl Audience {
    /// Whether `expected` is among the audiences.
    #[must_use]
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Self::One(aud) => aud == expected,
            Self::Many(auds) => auds.iter().any(|a| a == expected),
        }
    }
}

/// Registered and provider-specific claims read from a JWT payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    /// Expiry (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Not-before (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Issued-at (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Login hint used by organizational directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// User principal name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
    /// Email list used by consumer-identity tenants
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// App roles asserted by the provider
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Tenant id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
}

impl TokenClaims {
    /// First usable email-like claim, normalized.
    #[must_use]
    pub fn email(&self) -> Option<String> {
        self.email
            .iter()
            .chain(self.preferred_username.iter())
            .chain(self.upn.iter())
            .chain(self.emails.iter())
            .find_map(|candidate| normalize_email(candidate))
    }
}

/// A JWT split into its parts; the signature is not checked yet.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// Parsed JOSE header.
    pub header: TokenHeader,
    /// Parsed payload.
    pub claims: TokenClaims,
    raw: String,
}

impl DecodedToken {
    /// The original compact serialization.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Parses proxy assertions and bearer tokens.
pub struct PrincipalDecoder {
    /// Lowercased `identityProvider` alias → provider.
    aliases: Vec<(String, IdentityProvider)>,
}

impl PrincipalDecoder {
    /// Build the alias table from each provider's `assertion_names`.
    #[must_use]
    pub fn new(providers: &ProvidersConfig) -> Self {
        let aliases = IdentityProvider::ALL
            .into_iter()
            .flat_map(|provider| {
                providers
                    .get(provider)
                    .assertion_names
                    .iter()
                    .map(move |name| (name.to_lowercase(), provider))
            })
            .collect();
        Self { aliases }
    }

    /// Decode either input shape.
    pub fn decode(&self, input: &AssertionInput) -> Result<Decoded, AuthError> {
        match input {
            AssertionInput::ProxyPrincipal(raw) => self.decode_proxy(raw).map(Decoded::Asserted),
            AssertionInput::BearerToken(raw) => Self::decode_bearer(raw).map(Decoded::Unverified),
        }
    }

    /// Decode the proxy's base64 JSON principal descriptor.
    pub fn decode_proxy(&self, raw: &str) -> Result<Principal, AuthError> {
        let bytes = ASSERTION_ENGINE
            .decode(raw.trim())
            .map_err(|e| AuthError::MalformedAssertion(format!("invalid base64: {e}")))?;
        let assertion: ProxyAssertion = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::MalformedAssertion(format!("invalid principal JSON: {e}")))?;

        let provider = self.provider_for(&assertion.identity_provider).ok_or_else(|| {
            AuthError::MalformedAssertion(format!(
                "unknown identity provider: {}",
                assertion.identity_provider
            ))
        })?;

        let email = normalize_email(&assertion.user_details).ok_or_else(|| {
            AuthError::MalformedAssertion("userDetails is not an email address".to_string())
        })?;

        // `userId` is optional; the email is the stable key otherwise.
        let user_id = assertion
            .user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        Ok(Principal {
            subject_id: user_id.clone().unwrap_or_else(|| email.clone()),
            email,
            issuing_provider: provider,
            provider_roles: assertion
                .user_roles
                .into_iter()
                .filter(|r| !r.is_empty() && r != "anonymous")
                .collect(),
            display_name: user_id,
            tenant_id: None,
            trust: TrustLevel::Asserted,
        })
    }

    /// Split a compact JWT and parse its header and payload.
    pub fn decode_bearer(raw: &str) -> Result<DecodedToken, AuthError> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(AuthError::MalformedToken(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }

        let header = decode_segment::<TokenHeader>(segments[0], "header")?;
        let claims = decode_segment::<TokenClaims>(segments[1], "payload")?;

        Ok(DecodedToken {
            header,
            claims,
            raw: raw.to_string(),
        })
    }

    fn provider_for(&self, name: &str) -> Option<IdentityProvider> {
        let name = name.to_lowercase();
        self.aliases
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, provider)| *provider)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str, what: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::MalformedToken(format!("{what} is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::MalformedToken(format!("{what} is not valid JSON: {e}")))
}
