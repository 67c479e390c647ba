//! Signing key cache: per-provider JWKS with single-flight refresh.
//!
//! # Behavior
//!
//! - A lookup hits the cached [`SigningKeySet`] while it is fresh.
//! - A miss (unknown `kid`, stale set, or empty cache) takes the refresh
//!   gate. Tasks queued behind an in-flight refresh re-check the cache when
//!   they get the gate, so N concurrent misses cost one fetch.
//! - A refresh replaces the set wholesale; readers only ever see a complete
//!   set through an `Arc` snapshot.
//! - A stale set is never used after its expiry. If the refresh fails the
//!   lookup fails with [`AuthError::KeySetUnavailable`].
//! - A fresh set fetched less than `min_refresh_interval` ago is not
//!   re-fetched for an unknown `kid`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, PublicKeyUse};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::AuthError;
use crate::config::ProviderConfig;

/// Source of a provider's published key set.
#[async_trait::async_trait]
pub trait KeySetFetcher: Send + Sync + 'static {
    /// Fetch and parse the JWKS document at `jwks_uri`.
    async fn fetch(&self, jwks_uri: &str) -> crate::Result<JwkSet>;
}

/// Fetches key sets over HTTP.
pub struct HttpKeySetFetcher {
    http: reqwest::Client,
}

impl HttpKeySetFetcher {
    /// Build a client bounded by `timeout`.
    pub fn new(timeout: Duration, https_only: bool) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(https_only)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, jwks_uri: &str) -> crate::Result<JwkSet> {
        let jwks = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        Ok(jwks)
    }
}

/// Key type of a published JWK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// `kty: RSA`
    Rsa,
    /// `kty: EC`
    EllipticCurve,
    /// `kty: OKP`
    OctetKeyPair,
}

impl KeyFamily {
    /// Whether a key of this family can verify `alg`.
    #[must_use]
    pub fn supports(self, alg: Algorithm) -> bool {
        match self {
            Self::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            Self::EllipticCurve => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
            Self::OctetKeyPair => matches!(alg, Algorithm::EdDSA),
        }
    }
}

/// One verification key.
#[derive(Clone)]
pub struct SigningKey {
    /// `kid` of the JWK.
    pub key_id: String,
    /// Key type, checked against the token's `alg`.
    pub family: KeyFamily,
    /// Key material.
    pub decoding_key: DecodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

/// An immutable snapshot of a provider's keys.
pub struct SigningKeySet {
    keys: HashMap<String, SigningKey>,
    fetched_at: Instant,
    expires_at: Instant,
    generation: u64,
}

impl SigningKeySet {
    fn from_jwks(jwks: &JwkSet, ttl: Duration, generation: u64) -> Self {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("Skipping JWK without kid");
                continue;
            };

            let converted = match &jwk.algorithm {
                AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                    .map(|k| (KeyFamily::Rsa, k)),
                AlgorithmParameters::EllipticCurve(ec) => {
                    DecodingKey::from_ec_components(&ec.x, &ec.y)
                        .map(|k| (KeyFamily::EllipticCurve, k))
                }
                AlgorithmParameters::OctetKeyPair(okp) => {
                    DecodingKey::from_ed_components(&okp.x).map(|k| (KeyFamily::OctetKeyPair, k))
                }
                AlgorithmParameters::OctetKey(_) => {
                    debug!(kid = %kid, "Skipping symmetric JWK");
                    continue;
                }
            };

            match converted {
                Ok((family, decoding_key)) => {
                    keys.insert(
                        kid.clone(),
                        SigningKey {
                            key_id: kid,
                            family,
                            decoding_key,
                        },
                    );
                }
                Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable JWK"),
            }
        }

        let fetched_at = Instant::now();
        Self {
            keys,
            fetched_at,
            expires_at: fetched_at + ttl,
            generation,
        }
    }

    /// Whether the set may still be used.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    /// Number of usable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// `true` when the set holds no usable key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids in the set, sorted.
    #[must_use]
    pub fn key_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Refresh counter; increases by one per successful fetch.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Cache of one provider's signing keys.
pub struct SigningKeyCache {
    jwks_uri: String,
    ttl: Duration,
    min_refresh_interval: Duration,
    fetch_timeout: Duration,
    fetcher: Arc<dyn KeySetFetcher>,
    current: RwLock<Option<Arc<SigningKeySet>>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl SigningKeyCache {
    /// Create an empty cache for `jwks_uri`.
    #[must_use]
    pub fn new(
        jwks_uri: impl Into<String>,
        ttl: Duration,
        min_refresh_interval: Duration,
        fetch_timeout: Duration,
        fetcher: Arc<dyn KeySetFetcher>,
    ) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            ttl,
            min_refresh_interval,
            fetch_timeout,
            fetcher,
            current: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a cache from a provider's configuration record.
    #[must_use]
    pub fn for_provider(
        provider: &ProviderConfig,
        fetch_timeout: Duration,
        fetcher: Arc<dyn KeySetFetcher>,
    ) -> Self {
        Self::new(
            provider.resolved_jwks_uri(),
            provider.jwks_ttl,
            provider.jwks_min_refresh_interval,
            fetch_timeout,
            fetcher,
        )
    }

    /// The JWKS endpoint this cache reads.
    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Current key set, fresh or not.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<SigningKeySet>> {
        self.current.read().clone()
    }

    /// Drop the cached set; the next lookup fetches.
    pub fn invalidate(&self) {
        *self.current.write() = None;
    }

    /// Look up the key for `kid`, refreshing the set when needed.
    pub async fn get_key(&self, kid: &str) -> Result<SigningKey, AuthError> {
        let observed = self.snapshot();
        if let Some(key) = observed
            .as_ref()
            .filter(|set| set.is_fresh())
            .and_then(|set| set.keys.get(kid))
        {
            return Ok(key.clone());
        }
        let observed_generation = observed.as_ref().map(|set| set.generation);

        let _gate = self.refresh_gate.lock().await;

        if let Some(set) = self.snapshot().filter(|set| set.is_fresh()) {
            if let Some(key) = set.keys.get(kid) {
                return Ok(key.clone());
            }
            let refreshed_while_waiting = Some(set.generation) != observed_generation;
            if refreshed_while_waiting || set.fetched_at.elapsed() < self.min_refresh_interval {
                debug!(kid = %kid, generation = set.generation, "Key id absent from fresh key set");
                return Err(AuthError::UnknownSigningKey(kid.to_string()));
            }
        }

        let set = self.refresh().await?;
        set.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownSigningKey(kid.to_string()))
    }

    /// Fetch the key set and replace the cache. Caller holds the refresh gate.
    async fn refresh(&self) -> Result<Arc<SigningKeySet>, AuthError> {
        debug!(jwks_uri = %self.jwks_uri, "Fetching signing key set");

        let jwks = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(&self.jwks_uri)).await {
            Ok(Ok(jwks)) => jwks,
            Ok(Err(e)) => {
                warn!(jwks_uri = %self.jwks_uri, error = %e, "Signing key set fetch failed");
                return Err(AuthError::KeySetUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!(jwks_uri = %self.jwks_uri, timeout = ?self.fetch_timeout, "Signing key set fetch timed out");
                return Err(AuthError::KeySetUnavailable(format!(
                    "fetch timed out after {}ms",
                    self.fetch_timeout.as_millis()
                )));
            }
        };

        let generation = self.snapshot().map_or(1, |set| set.generation + 1);
        let set = Arc::new(SigningKeySet::from_jwks(&jwks, self.ttl, generation));
        *self.current.write() = Some(Arc::clone(&set));

        info!(
            jwks_uri = %self.jwks_uri,
            keys = set.len(),
            generation,
            "Signing key set refreshed"
        );
        Ok(set)
    }
}
