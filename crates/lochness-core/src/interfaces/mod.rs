// crates/lochness-core/src/interfaces/mod.rs
// ============================================================================
// Module: Lochness Interfaces
// Description: Backend-agnostic interfaces for connectors and persistence.
// Purpose: Define the contract surfaces used by the vault and the orchestrator.
// Dependencies: async-trait, crate::core
// ============================================================================

//! ## Overview
//! Interfaces define how Lochness integrates with vendor APIs and durable
//! storage without embedding backend-specific details. Connector traits are
//! async and receive the credential as an argument on every call; they must
//! not retain it. Store traits are synchronous and must commit durably before
//! returning `Ok`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;
use thiserror::Error;

use crate::core::catalog::DataSinkInstance;
use crate::core::catalog::DataSinkType;
use crate::core::catalog::DataSourceInstance;
use crate::core::catalog::DataSourceType;
use crate::core::catalog::Project;
use crate::core::catalog::Site;
use crate::core::catalog::Subject;
use crate::core::change::ChangeItem;
use crate::core::change::ObjectContext;
use crate::core::change::ObjectKey;
use crate::core::change::Payload;
use crate::core::change::PutAck;
use crate::core::checkpoint::LedgerEntry;
use crate::core::credential::CredentialRecord;
use crate::core::credential::VaultMeta;
use crate::core::identifiers::InstanceRef;
use crate::core::identifiers::ProjectId;
use crate::core::identifiers::SinkInstanceId;
use crate::core::identifiers::SiteId;
use crate::core::identifiers::SourceInstanceId;
use crate::core::identifiers::SyncRunId;
use crate::core::run::SyncRun;
use crate::core::secret::Secret;
use crate::core::secret::SecretError;
use crate::core::time::Timestamp;
use crate::core::watermark::Watermark;

// ============================================================================
// SECTION: Connector Errors
// ============================================================================

/// Failure reported by a source or sink connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Retryable failure (timeouts, throttling, 5xx).
    #[error("transient connector error: {0}")]
    Transient(String),
    /// Credential rejected; retried with a freshly acquired credential.
    #[error("connector authentication expired: {0}")]
    AuthExpired(String),
    /// Non-retryable failure (forbidden, not found, bad request).
    #[error("permanent connector error: {0}")]
    Permanent(String),
    /// Upstream data could not be interpreted.
    #[error("malformed connector data: {0}")]
    Malformed(String),
    /// The vendor cursor is no longer valid; restart from the checkpoint.
    #[error("connector cursor expired: {0}")]
    CursorExpired(String),
}

impl ConnectorError {
    /// Returns true for errors retried with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::AuthExpired(_))
    }

    /// Returns the stable kind label used in run history.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::AuthExpired(_) => "auth_expired",
            Self::Permanent(_) => "permanent",
            Self::Malformed(_) => "malformed",
            Self::CursorExpired(_) => "cursor_expired",
        }
    }
}

impl From<SecretError> for ConnectorError {
    fn from(error: SecretError) -> Self {
        Self::Permanent(error.to_string())
    }
}

// ============================================================================
// SECTION: Source Connector
// ============================================================================

/// Source capability: enumerate items changed after a watermark.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Opens a change stream of items strictly after `since`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] when the listing cannot be started.
    async fn list_changes(
        &self,
        since: &Watermark,
        credential: &Secret,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError>;
}

/// Lazy, finite sequence of change items.
///
/// # Invariants
/// - Items are produced in ascending `(produced_at, external_id)` order.
/// - A failed `next_item` call does not consume the item; calling again retries it.
#[async_trait]
pub trait ChangeStream: Send {
    /// Produces the next item, or `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] when the item cannot be fetched.
    async fn next_item(&mut self, credential: &Secret)
    -> Result<Option<ChangeItem>, ConnectorError>;
}

// ============================================================================
// SECTION: Sink Connector
// ============================================================================

/// Sink capability: idempotent keyed writes.
///
/// # Invariants
/// - Same key and same payload twice is a no-op reported with `written = false`.
/// - Same key with a different payload overwrites (last write wins).
#[async_trait]
pub trait SinkConnector: Send + Sync {
    /// Durably stores `payload` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] when the write is not confirmed.
    async fn put(
        &self,
        key: &ObjectKey,
        payload: &Payload,
        context: &ObjectContext,
        credential: &Secret,
    ) -> Result<PutAck, ConnectorError>;
}

// ============================================================================
// SECTION: Store Errors
// ============================================================================

/// Persistence backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store I/O error.
    #[error("store io error: {0}")]
    Io(String),
    /// Store corruption.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data.
    #[error("store invalid data: {0}")]
    Invalid(String),
    /// Write rejected because it conflicts with existing state.
    #[error("store conflict: {0}")]
    Conflict(String),
    /// Other store errors.
    #[error("store error: {0}")]
    Store(String),
}

// ============================================================================
// SECTION: Checkpoint Store
// ============================================================================

/// Checkpoint store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    /// Proposed watermark is lower than the stored one.
    #[error("checkpoint regression for {instance}: stored {stored}, proposed {proposed}")]
    Regression {
        /// Instance whose checkpoint would regress.
        instance: SourceInstanceId,
        /// Stored watermark.
        stored: Watermark,
        /// Rejected watermark.
        proposed: Watermark,
    },
    /// No checkpoint exists for the instance.
    #[error("no checkpoint for {0}")]
    NotFound(SourceInstanceId),
    /// Backend failure.
    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for CheckpointError {
    fn from(error: StoreError) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Durable per-instance watermark plus in-flight ledger.
pub trait CheckpointStore: Send + Sync {
    /// Returns the stored watermark.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] when none exists.
    fn get(&self, instance: &SourceInstanceId) -> Result<Watermark, CheckpointError>;

    /// Advances the watermark and clears ledger entries at or below it, atomically.
    ///
    /// Advancing to the stored value is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Regression`] when `watermark` is lower than stored.
    fn advance(
        &self,
        instance: &SourceInstanceId,
        watermark: &Watermark,
    ) -> Result<(), CheckpointError>;

    /// Inserts or updates a ledger entry, keyed by its watermark.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] on backend failure.
    fn record_in_flight(
        &self,
        instance: &SourceInstanceId,
        entry: &LedgerEntry,
    ) -> Result<(), CheckpointError>;

    /// Returns ledger entries in watermark order.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] on backend failure.
    fn in_flight(&self, instance: &SourceInstanceId) -> Result<Vec<LedgerEntry>, CheckpointError>;

    /// Removes ledger entries at or below `up_to`, or all entries when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] on backend failure.
    fn clear_in_flight(
        &self,
        instance: &SourceInstanceId,
        up_to: Option<&Watermark>,
    ) -> Result<(), CheckpointError>;
}

// ============================================================================
// SECTION: Sync Run Store
// ============================================================================

/// Append-only run history.
pub trait SyncRunStore: Send + Sync {
    /// Records a new in-progress run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the instance already has an
    /// in-progress run or the id is taken.
    fn begin(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Records the completed form of an in-progress run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the run is unknown or already complete.
    fn finish(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Loads one run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn get_run(&self, id: &SyncRunId) -> Result<Option<SyncRun>, StoreError>;

    /// Lists runs for an instance, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn list_runs(&self, instance: &SourceInstanceId, limit: usize) -> Result<Vec<SyncRun>, StoreError>;

    /// Marks every in-progress run as abandoned and returns their ids.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn abandon_in_progress(&self, at: Timestamp) -> Result<Vec<SyncRunId>, StoreError>;
}

// ============================================================================
// SECTION: Credential Record Store
// ============================================================================

/// Ciphertext persistence for the vault.
pub trait CredentialRecordStore: Send + Sync {
    /// Loads vault key metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn load_vault_meta(&self) -> Result<Option<VaultMeta>, StoreError>;

    /// Persists vault key metadata once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when metadata already exists.
    fn init_vault_meta(&self, meta: &VaultMeta) -> Result<(), StoreError>;

    /// Inserts a credential version, deactivating any other active version
    /// of the same instance reference in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the version already exists.
    fn insert_credential(&self, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Loads one credential version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn load_credential(
        &self,
        instance_ref: &InstanceRef,
        version: u32,
    ) -> Result<Option<CredentialRecord>, StoreError>;

    /// Loads the active credential version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn load_active_credential(
        &self,
        instance_ref: &InstanceRef,
    ) -> Result<Option<CredentialRecord>, StoreError>;

    /// Lists every version of a credential, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn list_credentials(&self, instance_ref: &InstanceRef)
    -> Result<Vec<CredentialRecord>, StoreError>;
}

// ============================================================================
// SECTION: Catalog Store
// ============================================================================

/// Catalog errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// Referenced entry does not exist.
    #[error("catalog entry not found: {0}")]
    NotFound(String),
    /// Connector type is not recognized.
    #[error("unknown connector type: {0}")]
    UnknownType(String),
    /// Metadata failed validation.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    /// Entry already exists.
    #[error("catalog entry already exists: {0}")]
    Duplicate(String),
    /// Backend failure.
    #[error("catalog storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for CatalogError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(message) => Self::Duplicate(message),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Catalog of projects, sites, subjects, connector types, and instances.
///
/// Entries are immutable once created.
pub trait CatalogStore: Send + Sync {
    /// Creates a project.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Duplicate`] when it already exists.
    fn create_project(&self, project: &Project) -> Result<(), CatalogError>;

    /// Creates a site under an existing project.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] for an unknown project.
    fn create_site(&self, site: &Site) -> Result<(), CatalogError>;

    /// Creates a subject under an existing site.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] for an unknown site.
    fn create_subject(&self, subject: &Subject) -> Result<(), CatalogError>;

    /// Lists subjects of a site.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Storage`] on backend failure.
    fn list_subjects(
        &self,
        project: &ProjectId,
        site: &SiteId,
    ) -> Result<Vec<Subject>, CatalogError>;

    /// Records a source type descriptor (replacing an existing one).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Storage`] on backend failure.
    fn register_source_type(&self, descriptor: &DataSourceType) -> Result<(), CatalogError>;

    /// Records a sink type descriptor (replacing an existing one).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Storage`] on backend failure.
    fn register_sink_type(&self, descriptor: &DataSinkType) -> Result<(), CatalogError>;

    /// Creates a validated source instance under an existing site.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] for duplicates, unknown parents, or invalid metadata.
    fn create_source_instance(&self, instance: &DataSourceInstance) -> Result<(), CatalogError>;

    /// Creates a validated sink instance under an existing site.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] for duplicates, unknown parents, or invalid metadata.
    fn create_sink_instance(&self, instance: &DataSinkInstance) -> Result<(), CatalogError>;

    /// Loads a source instance.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] when absent.
    fn source_instance(&self, id: &SourceInstanceId) -> Result<DataSourceInstance, CatalogError>;

    /// Loads a sink instance.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] when absent.
    fn sink_instance(&self, id: &SinkInstanceId) -> Result<DataSinkInstance, CatalogError>;

    /// Lists source instances, optionally only active ones.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Storage`] on backend failure.
    fn list_source_instances(&self, active_only: bool)
    -> Result<Vec<DataSourceInstance>, CatalogError>;

    /// Lists sink instances of a (project, site).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Storage`] on backend failure.
    fn list_sink_instances(
        &self,
        project: &ProjectId,
        site: &SiteId,
    ) -> Result<Vec<DataSinkInstance>, CatalogError>;

    /// Resolves the destination of a source instance.
    ///
    /// Uses the explicit sink binding when present, else the single sink of
    /// the same (project, site).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] when no sink exists and
    /// [`CatalogError::InvalidMetadata`] when the choice is ambiguous.
    fn sink_for(&self, source: &DataSourceInstance) -> Result<DataSinkInstance, CatalogError> {
        if let Some(sink_id) = &source.sink {
            return self.sink_instance(sink_id);
        }
        let mut sinks = self.list_sink_instances(&source.project, &source.site)?;
        match sinks.len() {
            0 => Err(CatalogError::NotFound(format!(
                "no sink for project {} site {}",
                source.project, source.site
            ))),
            1 => Ok(sinks.remove(0)),
            count => Err(CatalogError::InvalidMetadata(format!(
                "{count} sinks for project {} site {}; bind one explicitly on source {}",
                source.project, source.site, source.id
            ))),
        }
    }
}
