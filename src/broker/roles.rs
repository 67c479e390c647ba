//! Role resolution against the Directory Store.
//!
//! One point lookup per request. The record, when present, is the only
//! source of privileged roles: privileged names asserted by an identity
//! provider are dropped before merging. A suspended record overrides
//! everything. Store failures surface as
//! [`AuthError::DirectoryStoreUnavailable`]; nothing defaults to admin.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use broker_core::{ADMIN_ROLE, Principal, RecordStatus};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::AuthError;
use super::audit::{self, AuditEvent};
use super::directory::{AuthorizationRecord, DirectoryStore, StoreError, update_record};
use crate::config::BrokerConfig;

/// Records whose `last_login_at` is newer than this are not rewritten.
const LOGIN_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Where a principal's roles came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// An active record was merged in.
    Active,
    /// A suspended record denied everything.
    Suspended,
    /// No record exists and none was provisioned.
    Unregistered,
}

/// Outcome of role resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleResolution {
    /// Effective roles.
    pub roles: BTreeSet<String>,
    /// `true` iff `roles` contains `admin`.
    pub is_admin: bool,
    /// Record state that produced the roles.
    pub state: RecordState,
    /// Whether this call created the record.
    pub provisioned: bool,
}

impl RoleResolution {
    fn suspended() -> Self {
        Self {
            roles: BTreeSet::new(),
            is_admin: false,
            state: RecordState::Suspended,
            provisioned: false,
        }
    }

    /// Whether the principal is denied by suspension.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.state == RecordState::Suspended
    }
}

/// Resolves a principal's effective roles.
pub struct RoleResolver {
    store: Arc<dyn DirectoryStore>,
    provision_domains: Vec<String>,
    provision_roles: Vec<String>,
    privileged_roles: BTreeSet<String>,
}

impl RoleResolver {
    /// Build from the broker configuration.
    #[must_use]
    pub fn new(store: Arc<dyn DirectoryStore>, config: &BrokerConfig) -> Self {
        Self {
            store,
            provision_domains: config.normalized_provision_domains(),
            provision_roles: config.auto_provision_roles.clone(),
            privileged_roles: config.privileged_roles.iter().cloned().collect(),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DirectoryStore> {
        &self.store
    }

    /// Whether `email` belongs to an auto-provisioning domain.
    #[must_use]
    pub fn is_provisioning_domain(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.provision_domains.iter().any(|suffix| email.ends_with(suffix.as_str()))
    }

    /// Resolve `principal`'s roles.
    pub async fn resolve(&self, principal: &Principal) -> Result<RoleResolution, AuthError> {
        let email = principal.email.trim().to_lowercase();
        let provider_roles: BTreeSet<String> = principal
            .provider_roles
            .iter()
            .filter(|role| {
                let privileged = self.privileged_roles.contains(*role);
                if privileged {
                    debug!(email = %email, role = %role, "Ignoring privileged role asserted by provider");
                }
                !privileged
            })
            .cloned()
            .collect();

        let existing = self.store.find_by_email(&email).await.map_err(|e| {
            warn!(email = %email, error = %e, "Directory lookup failed");
            AuthError::from(e)
        })?;

        if let Some(record) = existing {
            return Ok(self.apply(record, provider_roles, false).await);
        }

        if !self.is_provisioning_domain(&email) {
            return Ok(RoleResolution {
                roles: provider_roles,
                is_admin: false,
                state: RecordState::Unregistered,
                provisioned: false,
            });
        }

        let mut record = AuthorizationRecord::new(
            email.clone(),
            self.provision_roles.iter().cloned(),
            RecordStatus::Active,
        );
        record.last_login_at = Some(record.created_at);

        match self.store.create(record).await {
            Ok(created) => {
                info!(email = %email, roles = ?created.roles, "Provisioned directory record");
                audit::emit(&AuditEvent::provisioned(&created));
                Ok(self.apply(created, provider_roles, true).await)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(email = %email, "Record created concurrently, re-reading");
                let winner = self
                    .store
                    .find_by_email(&email)
                    .await?
                    .ok_or_else(|| {
                        AuthError::DirectoryStoreUnavailable(format!(
                            "record for {email} reported as existing but not found"
                        ))
                    })?;
                Ok(self.apply(winner, provider_roles, false).await)
            }
            Err(e) => {
                warn!(email = %email, error = %e, "Directory create failed");
                Err(e.into())
            }
        }
    }

    async fn apply(
        &self,
        record: AuthorizationRecord,
        provider_roles: BTreeSet<String>,
        provisioned: bool,
    ) -> RoleResolution {
        if record.status == RecordStatus::Suspended {
            debug!(email = %record.email, "Record is suspended");
            return RoleResolution::suspended();
        }

        if !provisioned {
            self.refresh_login(&record).await;
        }

        let mut roles = provider_roles;
        roles.extend(record.roles);
        RoleResolution {
            is_admin: roles.contains(ADMIN_ROLE),
            roles,
            state: RecordState::Active,
            provisioned,
        }
    }

    /// Best effort; a failed write never changes the decision.
    async fn refresh_login(&self, record: &AuthorizationRecord) {
        let now = Utc::now();
        let recent = record.last_login_at.is_some_and(|at| {
            (now - at)
                .to_std()
                .is_ok_and(|elapsed| elapsed < LOGIN_REFRESH_INTERVAL)
        });
        if recent {
            return;
        }

        let result = update_record(self.store.as_ref(), &record.email, |r| {
            r.last_login_at = Some(now);
            true
        })
        .await;
        if let Err(e) = result {
            warn!(email = %record.email, error = %e, "Failed to refresh last login time");
        }
    }
}
