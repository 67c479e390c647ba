//! Fixtures shared by the broker's unit tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use broker_core::{IdentityProvider, Principal, TrustLevel};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

use super::jwks::KeySetFetcher;
use super::validator::TokenValidator;
use crate::config::Config;

pub const TEST_KEY_PEM: &[u8] = include_bytes!("../../tests/fixtures/test_rsa_private.pem");
pub const OTHER_KEY_PEM: &[u8] = include_bytes!("../../tests/fixtures/other_rsa_private.pem");
pub const JWKS: &str = include_str!("../../tests/fixtures/jwks.json");

pub const ADMIN_ISSUER: &str = "https://login.example.com/admin-tenant/v2.0";
pub const MEMBER_ISSUER: &str = "https://login.example.com/member-tenant/v2.0";
pub const AUDIENCE: &str = "api://auth-broker";

/// Serves the fixture key set for every URI.
pub struct StaticFetcher(JwkSet);

#[async_trait::async_trait]
impl KeySetFetcher for StaticFetcher {
    async fn fetch(&self, _jwks_uri: &str) -> crate::Result<JwkSet> {
        Ok(self.0.clone())
    }
}

pub fn static_fetcher() -> Arc<dyn KeySetFetcher> {
    Arc::new(StaticFetcher(serde_json::from_str(JWKS).unwrap()))
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.providers.admin.issuer = ADMIN_ISSUER.to_string();
    config.providers.admin.audience = AUDIENCE.to_string();
    config.providers.member.issuer = MEMBER_ISSUER.to_string();
    config.providers.member.audience = AUDIENCE.to_string();
    config.broker.auto_provision_domains = vec!["corp.example.com".to_string()];
    config
}

pub fn validator() -> TokenValidator {
    let config = config();
    TokenValidator::new(&config.providers, &config.broker, static_fetcher())
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn claims(issuer: &str, email: &str) -> Value {
    json!({
        "iss": issuer,
        "sub": "subject-1",
        "aud": AUDIENCE,
        "exp": now() + 3600,
        "iat": now(),
        "nbf": now(),
        "email": email,
        "name": "Test User",
        "tid": "tenant-1",
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

pub fn encode_segment(value: &Value) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
}

/// A structurally valid token with an arbitrary `alg` and a junk signature.
pub fn unsigned_token(alg: &str, claims: &Value) -> String {
    format!(
        "{}.{}.c2ln",
        encode_segment(&json!({"alg": alg, "kid": "test-key-1", "typ": "JWT"})),
        encode_segment(claims)
    )
}

pub fn principal(provider: IdentityProvider, email: &str) -> Principal {
    Principal {
        subject_id: "subject-1".to_string(),
        email: email.to_string(),
        issuing_provider: provider,
        provider_roles: BTreeSet::new(),
        display_name: None,
        tenant_id: None,
        trust: TrustLevel::Asserted,
    }
}
