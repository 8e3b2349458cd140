// crates/lochness-core/src/runtime/store.rs
// ============================================================================
// Module: Lochness In-Memory Store
// Description: In-memory checkpoint, run, credential, and catalog store.
// Purpose: Provide a deterministic store implementation without external deps.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`InMemoryStore`] implements every store interface over mutex-guarded
//! maps with the same semantics as the `SQLite` backend. It is not durable and
//! is intended for tests and dry runs.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::core::catalog::DataSinkInstance;
use crate::core::catalog::DataSinkType;
use crate::core::catalog::DataSourceInstance;
use crate::core::catalog::DataSourceType;
use crate::core::catalog::Project;
use crate::core::catalog::Site;
use crate::core::catalog::Subject;
use crate::core::checkpoint::LedgerEntry;
use crate::core::credential::CredentialRecord;
use crate::core::credential::VaultMeta;
use crate::core::identifiers::InstanceRef;
use crate::core::identifiers::ProjectId;
use crate::core::identifiers::SinkInstanceId;
use crate::core::identifiers::SiteId;
use crate::core::identifiers::SourceInstanceId;
use crate::core::identifiers::SubjectId;
use crate::core::identifiers::SyncRunId;
use crate::core::run::RunOutcome;
use crate::core::run::SyncRun;
use crate::core::time::Timestamp;
use crate::core::watermark::Watermark;
use crate::interfaces::CatalogError;
use crate::interfaces::CatalogStore;
use crate::interfaces::CheckpointError;
use crate::interfaces::CheckpointStore;
use crate::interfaces::CredentialRecordStore;
use crate::interfaces::StoreError;
use crate::interfaces::SyncRunStore;

// ============================================================================
// SECTION: State
// ============================================================================

/// Checkpoint row: watermark plus ledger keyed by watermark.
#[derive(Debug, Default)]
struct CheckpointRow {
    /// Stored watermark, if any.
    watermark: Option<Watermark>,
    /// In-flight ledger.
    ledger: BTreeMap<Watermark, LedgerEntry>,
}

/// Catalog tables.
#[derive(Debug, Default)]
struct CatalogTables {
    /// Projects by id.
    projects: BTreeMap<ProjectId, Project>,
    /// Sites by (project, site).
    sites: BTreeMap<(ProjectId, SiteId), Site>,
    /// Subjects by (project, site, subject).
    subjects: BTreeMap<(ProjectId, SiteId, SubjectId), Subject>,
    /// Source type descriptors by name.
    source_types: BTreeMap<String, DataSourceType>,
    /// Sink type descriptors by name.
    sink_types: BTreeMap<String, DataSinkType>,
    /// Source instances by id.
    sources: BTreeMap<SourceInstanceId, DataSourceInstance>,
    /// Sink instances by id.
    sinks: BTreeMap<SinkInstanceId, DataSinkInstance>,
}

/// Credential tables.
#[derive(Debug, Default)]
struct CredentialTables {
    /// Vault metadata.
    meta: Option<VaultMeta>,
    /// Records by (instance ref, version).
    records: BTreeMap<(InstanceRef, u32), CredentialRecord>,
}

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// In-memory store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    /// Checkpoints by instance.
    checkpoints: Arc<Mutex<BTreeMap<SourceInstanceId, CheckpointRow>>>,
    /// Runs in insertion order.
    runs: Arc<Mutex<Vec<SyncRun>>>,
    /// Credential tables.
    credentials: Arc<Mutex<CredentialTables>>,
    /// Catalog tables.
    catalog: Arc<Mutex<CatalogTables>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Locks a mutex, mapping poisoning to a store error.
fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>, StoreError> {
    mutex.lock().map_err(|_| StoreError::Store(format!("{name} mutex poisoned")))
}

// ============================================================================
// SECTION: Checkpoint Store
// ============================================================================

impl CheckpointStore for InMemoryStore {
    fn get(&self, instance: &SourceInstanceId) -> Result<Watermark, CheckpointError> {
        let guard = lock(&self.checkpoints, "checkpoint")?;
        guard
            .get(instance)
            .and_then(|row| row.watermark.clone())
            .ok_or_else(|| CheckpointError::NotFound(instance.clone()))
    }

    fn advance(
        &self,
        instance: &SourceInstanceId,
        watermark: &Watermark,
    ) -> Result<(), CheckpointError> {
        let mut guard = lock(&self.checkpoints, "checkpoint")?;
        let row = guard.entry(instance.clone()).or_default();
        if let Some(stored) = &row.watermark {
            if watermark < stored {
                return Err(CheckpointError::Regression {
                    instance: instance.clone(),
                    stored: stored.clone(),
                    proposed: watermark.clone(),
                });
            }
            if watermark == stored {
                return Ok(());
            }
        }
        row.watermark = Some(watermark.clone());
        row.ledger.retain(|mark, _| mark > watermark);
        drop(guard);
        Ok(())
    }

    fn record_in_flight(
        &self,
        instance: &SourceInstanceId,
        entry: &LedgerEntry,
    ) -> Result<(), CheckpointError> {
        let mut guard = lock(&self.checkpoints, "checkpoint")?;
        guard
            .entry(instance.clone())
            .or_default()
            .ledger
            .insert(entry.watermark.clone(), entry.clone());
        drop(guard);
        Ok(())
    }

    fn in_flight(&self, instance: &SourceInstanceId) -> Result<Vec<LedgerEntry>, CheckpointError> {
        let guard = lock(&self.checkpoints, "checkpoint")?;
        Ok(guard.get(instance).map(|row| row.ledger.values().cloned().collect()).unwrap_or_default())
    }

    fn clear_in_flight(
        &self,
        instance: &SourceInstanceId,
        up_to: Option<&Watermark>,
    ) -> Result<(), CheckpointError> {
        let mut guard = lock(&self.checkpoints, "checkpoint")?;
        if let Some(row) = guard.get_mut(instance) {
            match up_to {
                Some(limit) => row.ledger.retain(|mark, _| mark > limit),
                None => row.ledger.clear(),
            }
        }
        drop(guard);
        Ok(())
    }
}

// ============================================================================
// SECTION: Sync Run Store
// ============================================================================

impl SyncRunStore for InMemoryStore {
    fn begin(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut guard = lock(&self.runs, "run")?;
        if guard.iter().any(|existing| existing.id == run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        if guard.iter().any(|existing| {
            existing.instance == run.instance && existing.outcome == RunOutcome::InProgress
        }) {
            return Err(StoreError::Conflict(format!(
                "instance {} already has an in-progress run",
                run.instance
            )));
        }
        guard.push(run.clone());
        drop(guard);
        Ok(())
    }

    fn finish(&self, run: &SyncRun) -> Result<(), StoreError> {
        if !run.outcome.is_terminal() {
            return Err(StoreError::Invalid("finish requires a terminal outcome".to_string()));
        }
        let mut guard = lock(&self.runs, "run")?;
        let Some(existing) = guard.iter_mut().find(|existing| existing.id == run.id) else {
            return Err(StoreError::Conflict(format!("run {} not found", run.id)));
        };
        if existing.outcome != RunOutcome::InProgress {
            return Err(StoreError::Conflict(format!("run {} already finished", run.id)));
        }
        *existing = run.clone();
        drop(guard);
        Ok(())
    }

    fn get_run(&self, id: &SyncRunId) -> Result<Option<SyncRun>, StoreError> {
        let guard = lock(&self.runs, "run")?;
        Ok(guard.iter().find(|run| run.id == *id).cloned())
    }

    fn list_runs(&self, instance: &SourceInstanceId, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let guard = lock(&self.runs, "run")?;
        Ok(guard.iter().rev().filter(|run| run.instance == *instance).take(limit).cloned().collect())
    }

    fn abandon_in_progress(&self, at: Timestamp) -> Result<Vec<SyncRunId>, StoreError> {
        let mut guard = lock(&self.runs, "run")?;
        let mut abandoned = Vec::new();
        for run in guard.iter_mut().filter(|run| run.outcome == RunOutcome::InProgress) {
            run.outcome = RunOutcome::Abandoned;
            run.finished_at = Some(at);
            abandoned.push(run.id.clone());
        }
        drop(guard);
        Ok(abandoned)
    }
}

// ============================================================================
// SECTION: Credential Record Store
// ============================================================================

impl CredentialRecordStore for InMemoryStore {
    fn load_vault_meta(&self) -> Result<Option<VaultMeta>, StoreError> {
        Ok(lock(&self.credentials, "credential")?.meta.clone())
    }

    fn init_vault_meta(&self, meta: &VaultMeta) -> Result<(), StoreError> {
        let mut guard = lock(&self.credentials, "credential")?;
        if guard.meta.is_some() {
            return Err(StoreError::Conflict("vault metadata already initialized".to_string()));
        }
        guard.meta = Some(meta.clone());
        drop(guard);
        Ok(())
    }

    fn insert_credential(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let mut guard = lock(&self.credentials, "credential")?;
        let key = (record.instance_ref.clone(), record.version);
        if guard.records.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "credential {} version {} already exists",
                record.instance_ref, record.version
            )));
        }
        if record.active {
            for existing in guard.records.values_mut() {
                if existing.instance_ref == record.instance_ref {
                    existing.active = false;
                }
            }
        }
        guard.records.insert(key, record.clone());
        drop(guard);
        Ok(())
    }

    fn load_credential(
        &self,
        instance_ref: &InstanceRef,
        version: u32,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let guard = lock(&self.credentials, "credential")?;
        Ok(guard.records.get(&(instance_ref.clone(), version)).cloned())
    }

    fn load_active_credential(
        &self,
        instance_ref: &InstanceRef,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let guard = lock(&self.credentials, "credential")?;
        Ok(guard
            .records
            .values()
            .find(|record| record.instance_ref == *instance_ref && record.active)
            .cloned())
    }

    fn list_credentials(
        &self,
        instance_ref: &InstanceRef,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let guard = lock(&self.credentials, "credential")?;
        Ok(guard
            .records
            .values()
            .filter(|record| record.instance_ref == *instance_ref)
            .cloned()
            .collect())
    }
}

// ============================================================================
// SECTION: Catalog Store
// ============================================================================

impl CatalogStore for InMemoryStore {
    fn create_project(&self, project: &Project) -> Result<(), CatalogError> {
        let mut guard = lock(&self.catalog, "catalog")?;
        if guard.projects.contains_key(&project.id) {
            return Err(CatalogError::Duplicate(format!("project {}", project.id)));
        }
        guard.projects.insert(project.id.clone(), project.clone());
        drop(guard);
        Ok(())
    }

    fn create_site(&self, site: &Site) -> Result<(), CatalogError> {
        let mut guard = lock(&self.catalog, "catalog")?;
        if !guard.projects.contains_key(&site.project) {
            return Err(CatalogError::NotFound(format!("project {}", site.project)));
        }
        let key = (site.project.clone(), site.id.clone());
        if guard.sites.contains_key(&key) {
            return Err(CatalogError::Duplicate(format!("site {}", site.id)));
        }
        guard.sites.insert(key, site.clone());
        drop(guard);
        Ok(())
    }

    fn create_subject(&self, subject: &Subject) -> Result<(), CatalogError> {
        let mut guard = lock(&self.catalog, "catalog")?;
        if !guard.sites.contains_key(&(subject.project.clone(), subject.site.clone())) {
            return Err(CatalogError::NotFound(format!("site {}", subject.site)));
        }
        let key = (subject.project.clone(), subject.site.clone(), subject.id.clone());
        if guard.subjects.contains_key(&key) {
            return Err(CatalogError::Duplicate(format!("subject {}", subject.id)));
        }
        guard.subjects.insert(key, subject.clone());
        drop(guard);
        Ok(())
    }

    fn list_subjects(&self, project: &ProjectId, site: &SiteId) -> Result<Vec<Subject>, CatalogError> {
        let guard = lock(&self.catalog, "catalog")?;
        Ok(guard
            .subjects
            .values()
            .filter(|subject| subject.project == *project && subject.site == *site)
            .cloned()
            .collect())
    }

    fn register_source_type(&self, descriptor: &DataSourceType) -> Result<(), CatalogError> {
        let mut guard = lock(&self.catalog, "catalog")?;
        guard.source_types.insert(descriptor.name.to_string(), descriptor.clone());
        drop(guard);
        Ok(())
    }

    fn register_sink_type(&self, descriptor: &DataSinkType) -> Result<(), CatalogError> {
        let mut guard = lock(&self.catalog, "catalog")?;
        guard.sink_types.insert(descriptor.name.to_string(), descriptor.clone());
        drop(guard);
        Ok(())
    }

    fn create_source_instance(&self, instance: &DataSourceInstance) -> Result<(), CatalogError> {
        instance.validate()?;
        let mut guard = lock(&self.catalog, "catalog")?;
        if !guard.sites.contains_key(&(instance.project.clone(), instance.site.clone())) {
            return Err(CatalogError::NotFound(format!("site {}", instance.site)));
        }
        if guard.sources.contains_key(&instance.id) {
            return Err(CatalogError::Duplicate(format!("source instance {}", instance.id)));
        }
        guard.sources.insert(instance.id.clone(), instance.clone());
        drop(guard);
        Ok(())
    }

    fn create_sink_instance(&self, instance: &DataSinkInstance) -> Result<(), CatalogError> {
        instance.validate()?;
        let mut guard = lock(&self.catalog, "catalog")?;
        if !guard.sites.contains_key(&(instance.project.clone(), instance.site.clone())) {
            return Err(CatalogError::NotFound(format!("site {}", instance.site)));
        }
        if guard.sinks.contains_key(&instance.id) {
            return Err(CatalogError::Duplicate(format!("sink instance {}", instance.id)));
        }
        guard.sinks.insert(instance.id.clone(), instance.clone());
        drop(guard);
        Ok(())
    }

    fn source_instance(&self, id: &SourceInstanceId) -> Result<DataSourceInstance, CatalogError> {
        let guard = lock(&self.catalog, "catalog")?;
        guard
            .sources
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("source instance {id}")))
    }

    fn sink_instance(&self, id: &SinkInstanceId) -> Result<DataSinkInstance, CatalogError> {
        let guard = lock(&self.catalog, "catalog")?;
        guard
            .sinks
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("sink instance {id}")))
    }

    fn list_source_instances(
        &self,
        active_only: bool,
    ) -> Result<Vec<DataSourceInstance>, CatalogError> {
        let guard = lock(&self.catalog, "catalog")?;
        Ok(guard
            .sources
            .values()
            .filter(|instance| !active_only || instance.active)
            .cloned()
            .collect())
    }

    fn list_sink_instances(
        &self,
        project: &ProjectId,
        site: &SiteId,
    ) -> Result<Vec<DataSinkInstance>, CatalogError> {
        let guard = lock(&self.catalog, "catalog")?;
        Ok(guard
            .sinks
            .values()
            .filter(|instance| instance.project == *project && instance.site == *site)
            .cloned()
            .collect())
    }
}
