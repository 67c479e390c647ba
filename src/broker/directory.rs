//! Directory Store: persisted authorization records keyed by email.
//!
//! The [`DirectoryStore`] trait is the whole contract the broker relies on:
//! a point lookup, a conditional create that reports a uniqueness conflict
//! distinguishably, and a versioned conditional replace. Two backends ship:
//!
//! - [`InMemoryDirectoryStore`]: a `DashMap`, atomic per key through the
//!   entry API.
//! - [`FileDirectoryStore`]: the in-memory index plus a JSON snapshot that is
//!   rewritten (temp file + rename) after every mutation.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use broker_core::{RecordStatus, normalize_email};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AuthError;
use crate::config::{DirectoryBackend, DirectoryConfig, SeedRecord};
use crate::{Error, Result};

/// Attempts made by [`update_record`] before giving up on version conflicts.
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// One user's authorization state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRecord {
    /// Opaque record id.
    pub id: Uuid,
    /// Lowercase email, unique across the store.
    pub email: String,
    /// Granted roles.
    pub roles: BTreeSet<String>,
    /// Lifecycle state.
    pub status: RecordStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Last successful authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token; bumped by every replace.
    #[serde(default)]
    pub version: u64,
}

impl AuthorizationRecord {
    /// A fresh record at version 0.
    pub fn new(
        email: impl Into<String>,
        roles: impl IntoIterator<Item = String>,
        status: RecordStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            roles: roles.into_iter().collect(),
            status,
            created_at: now,
            updated_at: now,
            last_login_at: None,
            version: 0,
        }
    }

    /// Whether the record's roles apply.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }
}

/// Directory Store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A record with this email already exists.
    #[error("record already exists: {0}")]
    Conflict(String),

    /// The stored version differs from the one being replaced.
    #[error("record {email} changed concurrently (expected version {expected})")]
    VersionConflict {
        /// Record key.
        email: String,
        /// Version the caller read.
        expected: u64,
    },

    /// No record with this email.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The backend could not serve the request.
    #[error("directory store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::DirectoryStoreUnavailable(err.to_string())
    }
}

/// Storage contract for authorization records.
#[async_trait::async_trait]
pub trait DirectoryStore: Send + Sync + 'static {
    /// Point lookup by normalized email.
    async fn find_by_email(&self, email: &str) -> std::result::Result<Option<AuthorizationRecord>, StoreError>;

    /// Insert `record` unless its email is taken ([`StoreError::Conflict`]).
    async fn create(&self, record: AuthorizationRecord) -> std::result::Result<AuthorizationRecord, StoreError>;

    /// Overwrite the stored record if its version still equals
    /// `record.version`; the stored copy gets `version + 1`.
    async fn replace(&self, record: AuthorizationRecord) -> std::result::Result<AuthorizationRecord, StoreError>;

    /// Every record, ordered by email.
    async fn list(&self) -> std::result::Result<Vec<AuthorizationRecord>, StoreError>;
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryDirectoryStore {
    records: DashMap<String, AuthorizationRecord>,
}

impl InMemoryDirectoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn from_records(records: impl IntoIterator<Item = AuthorizationRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.email.clone(), record);
        }
        store
    }

    fn insert_new(&self, record: AuthorizationRecord) -> std::result::Result<AuthorizationRecord, StoreError> {
        match self.records.entry(record.email.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(record.email)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    /// Returns the stored record and the one it replaced.
    fn swap_versioned(
        &self,
        mut record: AuthorizationRecord,
    ) -> std::result::Result<(AuthorizationRecord, AuthorizationRecord), StoreError> {
        let Some(mut stored) = self.records.get_mut(&record.email) else {
            return Err(StoreError::NotFound(record.email));
        };
        if stored.version != record.version {
            return Err(StoreError::VersionConflict {
                email: record.email,
                expected: record.version,
            });
        }
        record.version += 1;
        let previous = std::mem::replace(&mut *stored, record.clone());
        Ok((record, previous))
    }

    fn snapshot(&self) -> Vec<AuthorizationRecord> {
        let mut records: Vec<AuthorizationRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.email.cmp(&b.email));
        records
    }
}

#[async_trait::async_trait]
impl DirectoryStore for InMemoryDirectoryStore {
    async fn find_by_email(&self, email: &str) -> std::result::Result<Option<AuthorizationRecord>, StoreError> {
        Ok(self.records.get(email).map(|r| r.value().clone()))
    }

    async fn create(&self, record: AuthorizationRecord) -> std::result::Result<AuthorizationRecord, StoreError> {
        self.insert_new(record)
    }

    async fn replace(&self, record: AuthorizationRecord) -> std::result::Result<AuthorizationRecord, StoreError> {
        self.swap_versioned(record).map(|(stored, _)| stored)
    }

    async fn list(&self) -> std::result::Result<Vec<AuthorizationRecord>, StoreError> {
        Ok(self.snapshot())
    }
}

/// Snapshot-file store: the in-memory index persisted as JSON.
pub struct FileDirectoryStore {
    path: PathBuf,
    index: InMemoryDirectoryStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileDirectoryStore {
    /// Open `path`, loading existing records. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let records: Vec<AuthorizationRecord> = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                Error::Directory(format!("failed to read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Directory(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Directory(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            Vec::new()
        };

        info!(path = %path.display(), records = records.len(), "Opened directory snapshot");

        Ok(Self {
            path,
            index: InMemoryDirectoryStore::from_records(records),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Snapshot file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the snapshot. Callers hold `write_lock`.
    async fn persist(&self) -> std::result::Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(&self.index.snapshot())
            .map_err(|e| StoreError::Unavailable(format!("failed to serialize records: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        write_private(&tmp, &content)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to write {}: {e}", tmp.display())))?;

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            StoreError::Unavailable(format!("failed to replace {}: {e}", self.path.display()))
        })
    }
}

/// Write `content` to a fresh owner-only (0600) file.
async fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    // A leftover temp file keeps its old mode; tighten it explicitly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600)).await?;
    }
    file.write_all(content).await?;
    file.sync_all().await
}

#[async_trait::async_trait]
impl DirectoryStore for FileDirectoryStore {
    async fn find_by_email(&self, email: &str) -> std::result::Result<Option<AuthorizationRecord>, StoreError> {
        self.index.find_by_email(email).await
    }

    async fn create(&self, record: AuthorizationRecord) -> std::result::Result<AuthorizationRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let created = self.index.insert_new(record)?;
        if let Err(e) = self.persist().await {
            self.index.records.remove(&created.email);
            return Err(e);
        }
        Ok(created)
    }

    async fn replace(&self, record: AuthorizationRecord) -> std::result::Result<AuthorizationRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let (stored, previous) = self.index.swap_versioned(record)?;
        if let Err(e) = self.persist().await {
            self.index.records.insert(previous.email.clone(), previous);
            return Err(e);
        }
        Ok(stored)
    }

    async fn list(&self) -> std::result::Result<Vec<AuthorizationRecord>, StoreError> {
        self.index.list().await
    }
}

/// Build the configured backend.
pub fn open_store(config: &DirectoryConfig) -> Result<Arc<dyn DirectoryStore>> {
    match config.backend {
        DirectoryBackend::Memory => Ok(Arc::new(InMemoryDirectoryStore::new())),
        DirectoryBackend::File => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| Error::Config("directory.path is required for the file backend".to_string()))?;
            Ok(Arc::new(FileDirectoryStore::open(path)?))
        }
    }
}

/// Create any seed record whose email has no record yet. Returns how many were created.
pub async fn seed(store: &dyn DirectoryStore, seeds: &[SeedRecord]) -> Result<usize> {
    let mut created = 0;
    for seed in seeds {
        let email = normalize_email(&seed.email)
            .ok_or_else(|| Error::Config(format!("invalid seed email: {}", seed.email)))?;
        let record = AuthorizationRecord::new(email.clone(), seed.roles.iter().cloned(), seed.status);
        match store.create(record).await {
            Ok(_) => {
                debug!(email = %email, "Seeded directory record");
                created += 1;
            }
            Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(Error::Directory(e.to_string())),
        }
    }
    Ok(created)
}

/// Read-modify-replace `email`'s record, retrying on version conflicts.
///
/// `mutate` returns `false` to leave the record untouched, in which case
/// the current record is returned without a write.
pub async fn update_record<F>(
    store: &dyn DirectoryStore,
    email: &str,
    mut mutate: F,
) -> std::result::Result<AuthorizationRecord, StoreError>
where
    F: FnMut(&mut AuthorizationRecord) -> bool + Send,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut record = store
            .find_by_email(email)
            .await?
            .ok_or_else(|| StoreError::NotFound(email.to_string()))?;
        if !mutate(&mut record) {
            return Ok(record);
        }
        record.updated_at = Utc::now();

        match store.replace(record).await {
            Err(StoreError::VersionConflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                debug!(email = %email, attempt, "Record changed concurrently, retrying");
            }
            other => return other,
        }
    }

    warn!(email = %email, "Giving up on record update after repeated conflicts");
    Err(StoreError::Unavailable(format!("record {email} kept changing")))
}
