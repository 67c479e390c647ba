//! Configuration management

use std::{env, path::Path, time::Duration};

use broker_core::{ADMIN_ROLE, AUTHENTICATED_ROLE, IdentityProvider, RecordStatus};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Authorization decision configuration
    pub broker: BrokerConfig,
    /// Identity provider records
    pub providers: ProvidersConfig,
    /// On-behalf-of exchange configuration
    pub delegation: DelegationConfig,
    /// Directory Store configuration
    pub directory: DirectoryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39480,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// How inbound identities are accepted and how roles are resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Header carrying the reverse proxy's base64 principal descriptor
    pub assertion_header: String,
    /// Accept the proxy assertion header (trusted network boundary)
    pub trust_proxy_assertion: bool,
    /// Accept and independently verify `Authorization: Bearer` JWTs
    pub accept_bearer_tokens: bool,
    /// Tolerance for `nbf` / `iat` in the future
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Email suffixes whose owners get a record on first sign-in (e.g. `@org.example`)
    pub auto_provision_domains: Vec<String>,
    /// Roles written on auto-provisioned records
    pub auto_provision_roles: Vec<String>,
    /// Roles that only the Directory Store may grant
    pub privileged_roles: Vec<String>,
    /// Upper bound for JWKS fetches
    #[serde(with = "humantime_serde")]
    pub jwks_fetch_timeout: Duration,
    /// Refuse plain-HTTP JWKS and token endpoints
    pub require_https: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            assertion_header: "x-ms-client-principal".to_string(),
            trust_proxy_assertion: true,
            accept_bearer_tokens: true,
            clock_skew: Duration::from_secs(300),
            auto_provision_domains: Vec::new(),
            auto_provision_roles: vec![ADMIN_ROLE.to_string(), AUTHENTICATED_ROLE.to_string()],
            privileged_roles: vec![ADMIN_ROLE.to_string()],
            jwks_fetch_timeout: Duration::from_secs(10),
            require_https: true,
        }
    }
}

impl BrokerConfig {
    /// Auto-provisioning suffixes normalized to lowercase `@domain` form.
    #[must_use]
    pub fn normalized_provision_domains(&self) -> Vec<String> {
        self.auto_provision_domains
            .iter()
            .map(|d| {
                let d = d.trim().to_lowercase();
                if d.starts_with('@') { d } else { format!("@{d}") }
            })
            .collect()
    }
}

/// One configuration record per [`IdentityProvider`] variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Organizational directory for administrators
    pub admin: ProviderConfig,
    /// Consumer-identity tenant for members
    pub member: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            admin: ProviderConfig {
                assertion_names: vec!["admin-idp".to_string(), "aad".to_string()],
                ..ProviderConfig::default()
            },
            member: ProviderConfig {
                assertion_names: vec!["member-idp".to_string(), "aadb2c".to_string()],
                ..ProviderConfig::default()
            },
        }
    }
}

impl ProvidersConfig {
    /// Configuration record for `provider`.
    #[must_use]
    pub fn get(&self, provider: IdentityProvider) -> &ProviderConfig {
        match provider {
            IdentityProvider::AdminIdp => &self.admin,
            IdentityProvider::MemberIdp => &self.member,
        }
    }
}

/// Issuer, audience and endpoints of one identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Expected `iss` claim. Empty = bearer tokens from this provider are not accepted.
    pub issuer: String,
    /// Expected `aud` entry (usually this service's client id)
    pub audience: String,
    /// JWKS endpoint (default: `<issuer-base>/discovery/v2.0/keys`)
    pub jwks_uri: Option<String>,
    /// OAuth token endpoint (default: `<issuer-base>/oauth2/v2.0/token`)
    pub token_endpoint: Option<String>,
    /// `identityProvider` values in proxy assertions that map to this provider
    pub assertion_names: Vec<String>,
    /// How long a fetched key set is trusted
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
    /// Minimum spacing of refreshes triggered by unknown key ids
    #[serde(with = "humantime_serde")]
    pub jwks_min_refresh_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            jwks_uri: None,
            token_endpoint: None,
            assertion_names: Vec::new(),
            jwks_ttl: Duration::from_secs(3600),
            jwks_min_refresh_interval: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    /// Whether bearer tokens from this provider can be verified.
    #[must_use]
    pub fn accepts_bearer_tokens(&self) -> bool {
        !self.issuer.is_empty()
    }

    /// Configured JWKS URI or the provider-conventional default.
    #[must_use]
    pub fn resolved_jwks_uri(&self) -> String {
        self.jwks_uri
            .clone()
            .unwrap_or_else(|| format!("{}/discovery/v2.0/keys", issuer_base(&self.issuer)))
    }

    /// Configured token endpoint or the provider-conventional default.
    #[must_use]
    pub fn resolved_token_endpoint(&self) -> String {
        self.token_endpoint
            .clone()
            .unwrap_or_else(|| format!("{}/oauth2/v2.0/token", issuer_base(&self.issuer)))
    }
}

/// Strip a trailing `/` and `/v2.0` version segment from an issuer URL.
fn issuer_base(issuer: &str) -> &str {
    let base = issuer.trim_end_matches('/');
    base.strip_suffix("/v2.0").unwrap_or(base)
}

/// Service credential for the on-behalf-of exchange.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Enable `/delegate` endpoints
    pub enabled: bool,
    /// This service's registered client id
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME`)
    pub client_secret: Option<String>,
    /// Scopes requested when the caller names none
    pub default_scopes: Vec<String>,
    /// Upper bound for token endpoint calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id: String::new(),
            client_secret: None,
            default_scopes: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for DelegationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationConfig")
            .field("enabled", &self.enabled)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("default_scopes", &self.default_scopes)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DelegationConfig {
    /// Resolve the client secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret.as_ref().map(|secret| {
            if let Some(var_name) = secret.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| secret.clone())
            } else {
                secret.clone()
            }
        })
    }
}

/// Directory Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryBackend {
    /// Process-local map; records vanish on restart
    #[default]
    Memory,
    /// JSON snapshot file
    File,
}

/// Directory Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Which backend to use
    pub backend: DirectoryBackend,
    /// Snapshot path for the `file` backend
    pub path: Option<String>,
    /// Records created at startup when absent
    pub seed: Vec<SeedRecord>,
}

/// A record created at startup if the email has none yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRecord {
    /// Email key
    pub email: String,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<String>,
    /// Initial status
    #[serde(default)]
    pub status: RecordStatus,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (AUTH_BROKER_ prefix)
        figment = figment.merge(Env::prefixed("AUTH_BROKER_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` patterns in config values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for provider in [&mut self.providers.admin, &mut self.providers.member] {
            provider.issuer = expand_string(&re, &provider.issuer);
            provider.audience = expand_string(&re, &provider.audience);
            if let Some(uri) = provider.jwks_uri.as_mut() {
                *uri = expand_string(&re, uri);
            }
            if let Some(endpoint) = provider.token_endpoint.as_mut() {
                *endpoint = expand_string(&re, endpoint);
            }
        }

        self.delegation.client_id = expand_string(&re, &self.delegation.client_id);
        if let Some(secret) = self.delegation.client_secret.as_mut() {
            *secret = expand_string(&re, secret);
        }
        if let Some(path) = self.directory.path.as_mut() {
            *path = expand_home(&expand_string(&re, path));
        }
        Ok(())
    }

    /// Reject configurations the broker cannot run safely with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !self.broker.trust_proxy_assertion && !self.broker.accept_bearer_tokens {
            return Err(Error::Config(
                "broker accepts neither proxy assertions nor bearer tokens".to_string(),
            ));
        }

        for domain in self.broker.normalized_provision_domains() {
            let host = &domain[1..];
            if host.is_empty() || host.contains('@') || !host.contains('.') {
                return Err(Error::Config(format!(
                    "Invalid auto-provisioning domain: {domain}"
                )));
            }
        }

        for provider in IdentityProvider::ALL {
            let cfg = self.providers.get(provider);
            if !cfg.accepts_bearer_tokens() {
                continue;
            }
            if cfg.audience.is_empty() {
                return Err(Error::Config(format!(
                    "providers.{}: audience is required when issuer is set",
                    config_key(provider)
                )));
            }
            for (field, value) in [
                ("issuer", cfg.issuer.clone()),
                ("jwks_uri", cfg.resolved_jwks_uri()),
                ("token_endpoint", cfg.resolved_token_endpoint()),
            ] {
                let url = Url::parse(&value).map_err(|e| {
                    Error::Config(format!(
                        "providers.{}.{field}: invalid URL {value}: {e}",
                        config_key(provider)
                    ))
                })?;
                if self.broker.require_https && field != "issuer" && url.scheme() != "https" {
                    return Err(Error::Config(format!(
                        "providers.{}.{field} must use https",
                        config_key(provider)
                    )));
                }
            }
        }

        let names_overlap = self
            .providers
            .admin
            .assertion_names
            .iter()
            .any(|n| self.providers.member.assertion_names.contains(n));
        if names_overlap {
            return Err(Error::Config(
                "providers.admin and providers.member share an assertion name".to_string(),
            ));
        }

        if self.delegation.enabled
            && (self.delegation.client_id.is_empty() || self.delegation.client_secret.is_none())
        {
            return Err(Error::Config(
                "delegation.enabled requires client_id and client_secret".to_string(),
            ));
        }

        if self.directory.backend == DirectoryBackend::File && self.directory.path.is_none() {
            return Err(Error::Config(
                "directory.backend 'file' requires directory.path".to_string(),
            ));
        }

        Ok(())
    }
}

/// Key of a provider's section in the config file.
fn config_key(provider: IdentityProvider) -> &'static str {
    match provider {
        IdentityProvider::AdminIdp => "admin",
        IdentityProvider::MemberIdp => "member",
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours, 3600)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }

    /// `value * factor` seconds, rejecting overflow.
    fn scaled<E: serde::de::Error>(value: &str, factor: u64) -> Result<Duration, E> {
        let n = value.parse::<u64>().map_err(E::custom)?;
        n.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| E::custom(format!("duration out of range: {value}")))
    }
}
