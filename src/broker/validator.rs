//! Bearer token verification.
//!
//! The unverified `iss` selects the provider record; everything after that
//! is checked against the record, never against the token's own claims.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use broker_core::{IdentityProvider, Principal, TrustLevel};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation};
use tracing::debug;

use super::AuthError;
use super::jwks::{KeySetFetcher, SigningKeyCache};
use super::principal::{DecodedToken, TokenClaims};
use crate::config::{BrokerConfig, ProviderConfig, ProvidersConfig};

/// Algorithms a provider may sign with. Symmetric and `none` never verify.
const ALLOWED_ALGORITHMS: [Algorithm; 9] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// A bearer token whose signature and claims have been verified.
///
/// Only [`TokenValidator::validate`] constructs one, so holding a
/// `VerifiedToken` proves the raw token passed verification.
#[derive(Clone)]
pub struct VerifiedToken {
    principal: Principal,
    raw: String,
    expires_at: DateTime<Utc>,
}

impl VerifiedToken {
    /// The verified caller.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// The compact JWT, for forwarding as an exchange assertion.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The token's `exp`.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for VerifiedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedToken")
            .field("principal", &self.principal)
            .field("raw", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-provider verification state.
struct ProviderVerifier {
    provider: IdentityProvider,
    issuer: String,
    audience: String,
    keys: Arc<SigningKeyCache>,
}

/// Verifies bearer JWTs against the configured providers.
pub struct TokenValidator {
    verifiers: Vec<ProviderVerifier>,
    clock_skew: Duration,
}

impl TokenValidator {
    /// One key cache per provider that accepts bearer tokens.
    #[must_use]
    pub fn new(
        providers: &ProvidersConfig,
        broker: &BrokerConfig,
        fetcher: Arc<dyn KeySetFetcher>,
    ) -> Self {
        let verifiers = IdentityProvider::ALL
            .into_iter()
            .filter_map(|provider| {
                let config = providers.get(provider);
                config.accepts_bearer_tokens().then(|| {
                    ProviderVerifier::new(
                        provider,
                        config,
                        Arc::new(SigningKeyCache::for_provider(
                            config,
                            broker.jwks_fetch_timeout,
                            Arc::clone(&fetcher),
                        )),
                    )
                })
            })
            .collect();

        Self {
            verifiers,
            clock_skew: broker.clock_skew,
        }
    }

    /// The key cache serving `provider`, if it accepts bearer tokens.
    #[must_use]
    pub fn key_cache(&self, provider: IdentityProvider) -> Option<&Arc<SigningKeyCache>> {
        self.verifiers
            .iter()
            .find(|v| v.provider == provider)
            .map(|v| &v.keys)
    }

    /// Providers with bearer verification configured.
    #[must_use]
    pub fn providers(&self) -> Vec<IdentityProvider> {
        self.verifiers.iter().map(|v| v.provider).collect()
    }

    /// Verify a decoded token and build its [`Principal`].
    pub async fn validate(&self, token: &DecodedToken) -> Result<VerifiedToken, AuthError> {
        let alg = token
            .header
            .alg
            .parse::<Algorithm>()
            .ok()
            .filter(|alg| ALLOWED_ALGORITHMS.contains(alg))
            .ok_or_else(|| AuthError::UnsupportedAlgorithm(token.header.alg.clone()))?;

        let unverified_issuer = token.claims.iss.as_deref().unwrap_or_default();
        let verifier = self.verifier_for(unverified_issuer).ok_or_else(|| {
            AuthError::IssuerMismatch(unverified_issuer.to_string())
        })?;

        let kid = token
            .header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::MalformedToken("header has no kid".to_string()))?;
        let key = verifier.keys.get_key(kid).await?;
        if !key.family.supports(alg) {
            debug!(kid = %kid, alg = ?alg, family = ?key.family, "Key type does not match token algorithm");
            return Err(AuthError::InvalidSignature);
        }

        let claims = verify_signature(token.raw(), &key.decoding_key, alg)?;

        let now = Utc::now().timestamp();
        let exp = claims
            .exp
            .ok_or_else(|| AuthError::MalformedToken("missing exp".to_string()))?;
        if exp <= now {
            return Err(AuthError::TokenExpired);
        }
        let latest_acceptable = now.saturating_add(i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX));
        if claims.nbf.is_some_and(|nbf| nbf > latest_acceptable)
            || claims.iat.is_some_and(|iat| iat > latest_acceptable)
        {
            return Err(AuthError::TokenNotYetValid);
        }

        let issuer = claims.iss.as_deref().unwrap_or_default();
        if !same_issuer(issuer, &verifier.issuer) {
            return Err(AuthError::IssuerMismatch(issuer.to_string()));
        }
        if !claims.aud.as_ref().is_some_and(|aud| aud.contains(&verifier.audience)) {
            return Err(AuthError::AudienceMismatch);
        }

        let principal = verifier.principal_from(&claims)?;
        let expires_at = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| AuthError::MalformedToken("exp out of range".to_string()))?;

        debug!(
            provider = %principal.issuing_provider,
            subject = %principal.subject_id,
            "Bearer token verified"
        );

        Ok(VerifiedToken {
            principal,
            raw: token.raw().to_string(),
            expires_at,
        })
    }

    fn verifier_for(&self, issuer: &str) -> Option<&ProviderVerifier> {
        self.verifiers.iter().find(|v| same_issuer(&v.issuer, issuer))
    }
}

impl ProviderVerifier {
    fn new(provider: IdentityProvider, config: &ProviderConfig, keys: Arc<SigningKeyCache>) -> Self {
        Self {
            provider,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            keys,
        }
    }

    fn principal_from(&self, claims: &TokenClaims) -> Result<Principal, AuthError> {
        let subject_id = claims
            .sub
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::MalformedToken("missing sub".to_string()))?;
        let email = claims
            .email()
            .ok_or_else(|| AuthError::MalformedToken("no usable email claim".to_string()))?;

        Ok(Principal {
            subject_id,
            email,
            issuing_provider: self.provider,
            provider_roles: claims.roles.iter().filter(|r| !r.is_empty()).cloned().collect(),
            display_name: claims.name.clone(),
            tenant_id: claims.tid.clone(),
            trust: TrustLevel::Verified,
        })
    }
}

/// Signature check only; time and audience claims are checked by the caller.
fn verify_signature(
    raw: &str,
    key: &jsonwebtoken::DecodingKey,
    alg: Algorithm,
) -> Result<TokenClaims, AuthError> {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<TokenClaims>(raw, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidEcdsaKey
                | ErrorKind::InvalidKeyFormat => AuthError::InvalidSignature,
                _ => AuthError::MalformedToken(e.to_string()),
            }
        })
}

fn same_issuer(a: &str, b: &str) -> bool {
    !a.is_empty() && a.trim_end_matches('/') == b.trim_end_matches('/')
}
