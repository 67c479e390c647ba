//! Authorization broker.
//!
//! Per request: [`PrincipalDecoder`] → (bearer tokens only) [`TokenValidator`]
//! → [`IdentityProviderRouter`] → [`RoleResolver`]. Handlers receive an
//! [`Authorized`] value and may lazily ask for a downstream token through
//! [`Broker::delegate`].
//!
//! Every path fails closed: any error ends in a [`Denial`], never in a
//! partially authorized context.

pub mod audit;
pub mod delegation;
pub mod directory;
mod error;
pub mod jwks;
pub mod principal;
pub mod roles;
pub mod router;
#[cfg(test)]
pub(crate) mod testing;
pub mod validator;

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use broker_core::{Principal, RecordStatus, Surface, normalize_email};
use serde::Serialize;
use tracing::{debug, info};

pub use delegation::{DelegatedToken, DelegatedTokenExchanger};
pub use directory::{AuthorizationRecord, DirectoryStore, StoreError};
pub use error::{AuthError, ErrorKind};
pub use jwks::{HttpKeySetFetcher, KeySetFetcher, SigningKeyCache};
pub use principal::{AssertionInput, PrincipalDecoder};
pub use roles::{RoleResolution, RoleResolver};
pub use router::IdentityProviderRouter;
pub use validator::{TokenValidator, VerifiedToken};

use self::audit::AuditEvent;
use self::principal::Decoded;
use crate::config::{BrokerConfig, Config};

/// Error code reported for suspended records.
pub const SUSPENDED: &str = "suspended";

/// Authorization result handed to request handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    /// Whether a principal was established and authorized.
    pub is_authenticated: bool,
    /// The caller, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    /// Effective roles.
    pub roles: BTreeSet<String>,
    /// Admin flag.
    pub is_admin: bool,
    /// Error code when the request was denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthContext {
    /// No identity material was presented.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            is_authenticated: false,
            principal: None,
            roles: BTreeSet::new(),
            is_admin: false,
            error: None,
        }
    }
}

/// A request that passed every check.
#[derive(Debug, Clone)]
pub struct Authorized {
    /// Surface the request was authorized for.
    pub surface: Surface,
    /// The caller.
    pub principal: Principal,
    /// Resolved roles.
    pub resolution: RoleResolution,
    /// The verified bearer token, absent for proxy assertions.
    pub verified: Option<VerifiedToken>,
}

impl Authorized {
    /// The output contract for this request.
    #[must_use]
    pub fn context(&self) -> AuthContext {
        AuthContext {
            is_authenticated: true,
            principal: Some(self.principal.clone()),
            roles: self.resolution.roles.clone(),
            is_admin: self.resolution.is_admin,
            error: None,
        }
    }

    /// Whether the caller holds the admin flag.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.resolution.is_admin
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// Decoding, verification, routing or store failure.
    Error(AuthError),
    /// The caller's record is suspended.
    Suspended,
}

/// A request that failed authorization.
#[derive(Debug, Clone)]
pub struct Denial {
    /// The caller, if decoding got that far.
    pub principal: Option<Principal>,
    /// What went wrong.
    pub reason: DenialReason,
}

impl Denial {
    fn error(principal: Option<Principal>, err: AuthError) -> Self {
        Self {
            principal,
            reason: DenialReason::Error(err),
        }
    }

    /// HTTP status for this denial.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match &self.reason {
            DenialReason::Error(err) => err.status_code(),
            DenialReason::Suspended => StatusCode::FORBIDDEN,
        }
    }

    /// Stable `snake_case` error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match &self.reason {
            DenialReason::Error(err) => err.kind().as_str(),
            DenialReason::Suspended => SUSPENDED,
        }
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> String {
        match &self.reason {
            DenialReason::Error(err) => err.to_string(),
            DenialReason::Suspended => "account is suspended".to_string(),
        }
    }

    /// The output contract for this request.
    #[must_use]
    pub fn context(&self) -> AuthContext {
        AuthContext {
            is_authenticated: false,
            principal: None,
            roles: BTreeSet::new(),
            is_admin: false,
            error: Some(self.code().to_string()),
        }
    }
}

/// Record mutations available to administrators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    /// Add a role; creates the record when missing.
    GrantRole(String),
    /// Remove a role.
    RevokeRole(String),
    /// Deny everything; creates the record when missing.
    Suspend,
    /// Lift a suspension.
    Reactivate,
}

impl RecordChange {
    fn creates_missing(&self) -> bool {
        matches!(self, Self::GrantRole(_) | Self::Suspend)
    }

    /// Apply to `record`; `false` when nothing changed.
    fn apply(&self, record: &mut AuthorizationRecord) -> bool {
        match self {
            Self::GrantRole(role) => record.roles.insert(role.clone()),
            Self::RevokeRole(role) => record.roles.remove(role),
            Self::Suspend => std::mem::replace(&mut record.status, RecordStatus::Suspended) != RecordStatus::Suspended,
            Self::Reactivate => std::mem::replace(&mut record.status, RecordStatus::Active) != RecordStatus::Active,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::GrantRole(role) => format!("granted role {role}"),
            Self::RevokeRole(role) => format!("revoked role {role}"),
            Self::Suspend => "suspended".to_string(),
            Self::Reactivate => "reactivated".to_string(),
        }
    }
}

/// The request-path coordinator.
pub struct Broker {
    config: BrokerConfig,
    decoder: PrincipalDecoder,
    validator: TokenValidator,
    router: IdentityProviderRouter,
    roles: RoleResolver,
    exchanger: Option<DelegatedTokenExchanger>,
}

impl Broker {
    /// Assemble the broker from its injected dependencies.
    pub fn new(
        config: &Config,
        store: Arc<dyn DirectoryStore>,
        fetcher: Arc<dyn KeySetFetcher>,
    ) -> crate::Result<Self> {
        let exchanger = if config.delegation.enabled {
            Some(DelegatedTokenExchanger::new(
                &config.delegation,
                &config.providers,
                config.broker.require_https,
            )?)
        } else {
            None
        };

        Ok(Self {
            config: config.broker.clone(),
            decoder: PrincipalDecoder::new(&config.providers),
            validator: TokenValidator::new(&config.providers, &config.broker, fetcher),
            router: IdentityProviderRouter::new(),
            roles: RoleResolver::new(store, &config.broker),
            exchanger,
        })
    }

    /// Build with the HTTP key fetcher and the configured store, seeding it.
    pub async fn from_config(config: &Config) -> crate::Result<Self> {
        let fetcher = Arc::new(HttpKeySetFetcher::new(
            config.broker.jwks_fetch_timeout,
            config.broker.require_https,
        )?);
        let store = directory::open_store(&config.directory)?;
        let seeded = directory::seed(store.as_ref(), &config.directory.seed).await?;
        if seeded > 0 {
            info!(records = seeded, "Seeded directory store");
        }
        Self::new(config, store, fetcher)
    }

    /// Decision-path configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The token validator (and its key caches).
    #[must_use]
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// The Directory Store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DirectoryStore> {
        self.roles.store()
    }

    /// Whether on-behalf-of exchange is configured.
    #[must_use]
    pub fn delegation_enabled(&self) -> bool {
        self.exchanger.is_some()
    }

    /// Authorize a request from its headers. `Ok(None)` = anonymous.
    pub async fn authorize_headers(
        &self,
        headers: &HeaderMap,
        surface: Surface,
    ) -> Result<Option<Authorized>, Denial> {
        let input = AssertionInput::from_headers(headers, &self.config);
        self.authorize(input.as_ref(), surface).await
    }

    /// Authorize one request for `surface`. `Ok(None)` = anonymous.
    pub async fn authorize(
        &self,
        input: Option<&AssertionInput>,
        surface: Surface,
    ) -> Result<Option<Authorized>, Denial> {
        let Some(input) = input else {
            return Ok(None);
        };

        let (principal, verified) = self
            .identify(input)
            .await
            .map_err(|err| deny(surface, None, err))?;

        if let Err(err) = self.router.check(principal.issuing_provider, surface) {
            return Err(deny(surface, Some(principal), err));
        }

        let resolution = match self.roles.resolve(&principal).await {
            Ok(resolution) => resolution,
            Err(err) => return Err(deny(surface, Some(principal), err)),
        };

        if resolution.is_suspended() {
            audit::emit(&AuditEvent::denied_with(
                surface,
                Some(&principal),
                SUSPENDED,
                "record is suspended",
            ));
            return Err(Denial {
                principal: Some(principal),
                reason: DenialReason::Suspended,
            });
        }

        audit::emit(&AuditEvent::granted(
            surface,
            &principal,
            &resolution.roles,
            resolution.is_admin,
        ));

        Ok(Some(Authorized {
            surface,
            principal,
            resolution,
            verified,
        }))
    }

    async fn identify(
        &self,
        input: &AssertionInput,
    ) -> Result<(Principal, Option<VerifiedToken>), AuthError> {
        match self.decoder.decode(input)? {
            Decoded::Asserted(principal) => Ok((principal, None)),
            Decoded::Unverified(token) => {
                let verified = self.validator.validate(&token).await?;
                Ok((verified.principal().clone(), Some(verified)))
            }
        }
    }

    /// Exchange the caller's verified bearer token for a downstream token.
    ///
    /// Proxy-asserted callers have no token to exchange and get
    /// [`AuthError::InvalidGrant`].
    pub async fn delegate(
        &self,
        authorized: &Authorized,
        scopes: &[String],
    ) -> Result<DelegatedToken, AuthError> {
        let exchanger = self.exchanger.as_ref().ok_or_else(|| {
            AuthError::TokenEndpointUnavailable("delegation is not configured".to_string())
        })?;
        let verified = authorized.verified.as_ref().ok_or_else(|| {
            AuthError::InvalidGrant("delegation requires a verified bearer token".to_string())
        })?;

        let requested: Vec<String> = if scopes.is_empty() {
            exchanger.default_scopes().to_vec()
        } else {
            scopes.to_vec()
        };

        match exchanger.exchange(verified, &requested).await {
            Ok(token) => {
                audit::emit(&AuditEvent::delegated(&authorized.principal, &token.scopes));
                Ok(token)
            }
            Err(err) => {
                audit::emit(&AuditEvent::delegation_failed(
                    &authorized.principal,
                    &requested,
                    &err,
                ));
                Err(err)
            }
        }
    }

    /// Look up a record by email.
    pub async fn record(&self, email: &str) -> Result<Option<AuthorizationRecord>, StoreError> {
        let email = normalize_email(email).ok_or_else(|| StoreError::NotFound(email.to_string()))?;
        self.store().find_by_email(&email).await
    }

    /// Apply an administrator's change to `email`'s record.
    pub async fn update_record(
        &self,
        actor: &Authorized,
        email: &str,
        change: RecordChange,
    ) -> Result<AuthorizationRecord, StoreError> {
        let email = normalize_email(email).ok_or_else(|| StoreError::NotFound(email.to_string()))?;
        let store = self.store().as_ref();

        let updated = match directory::update_record(store, &email, |r| change.apply(r)).await {
            Err(StoreError::NotFound(_)) if change.creates_missing() => {
                let mut record = AuthorizationRecord::new(email.clone(), Vec::new(), RecordStatus::Active);
                change.apply(&mut record);
                match store.create(record).await {
                    Err(StoreError::Conflict(_)) => {
                        debug!(email = %email, "Record appeared concurrently, updating instead");
                        directory::update_record(store, &email, |r| change.apply(r)).await?
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        info!(email = %email, actor = %actor.principal.email, change = %change.describe(), "Directory record updated");
        audit::emit(&AuditEvent::record_updated(
            &updated,
            &actor.principal.email,
            change.describe(),
        ));
        Ok(updated)
    }
}

fn deny(surface: Surface, principal: Option<Principal>, err: AuthError) -> Denial {
    debug!(surface = %surface, error = %err, "Authorization denied");
    audit::emit(&AuditEvent::denied(surface, principal.as_ref(), &err));
    Denial::error(principal, err)
}
