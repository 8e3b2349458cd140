// crates/lochness-sync/tests/common/mod.rs
// ============================================================================
// Module: Common Sync Test Utilities
// Description: Seeded catalog, vault, and scripted connectors for sync tests.
// Purpose: Drive the orchestrator end to end without network access.
// Dependencies: async-trait, lochness-connectors, lochness-core, lochness-sync
// ============================================================================

//! ## Overview
//! [`Harness`] seeds one project, site, memory source `sim-1`, and memory
//! sink `mem-1`, stores their credentials, and unlocks a vault with cheap KDF
//! parameters. Scripted connectors let tests inject failures per key and
//! produce items in arbitrary order.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    dead_code,
    reason = "Test-only helpers; not every test file uses every helper."
)]

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lochness_connectors::ConnectorOptions;
use lochness_connectors::ConnectorRegistry;
use lochness_connectors::MemoryBackends;
use lochness_connectors::MemoryObjects;
use lochness_connectors::MemorySourceFactory;
use lochness_connectors::SinkFactory;
use lochness_connectors::SourceFactory;
use lochness_connectors::sinks::MemorySink;
use lochness_core::CatalogStore;
use lochness_core::ChangeItem;
use lochness_core::ChangeStream;
use lochness_core::CheckpointStore;
use lochness_core::ConnectorError;
use lochness_core::CredentialRecordStore;
use lochness_core::DataSinkInstance;
use lochness_core::DataSinkType;
use lochness_core::DataSourceInstance;
use lochness_core::DataSourceType;
use lochness_core::ExternalId;
use lochness_core::InstanceRef;
use lochness_core::KdfParams;
use lochness_core::MemorySinkMetadata;
use lochness_core::MemorySourceMetadata;
use lochness_core::ObjectContext;
use lochness_core::ObjectKey;
use lochness_core::Payload;
use lochness_core::Project;
use lochness_core::ProjectId;
use lochness_core::PutAck;
use lochness_core::Secret;
use lochness_core::SinkConnector;
use lochness_core::SinkInstanceId;
use lochness_core::SinkMetadata;
use lochness_core::Site;
use lochness_core::SiteId;
use lochness_core::SourceConnector;
use lochness_core::SourceInstanceId;
use lochness_core::SourceMetadata;
use lochness_core::SubjectId;
use lochness_core::SyncRunStore;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use lochness_sync::Orchestrator;
use lochness_sync::RetryPolicy;
use lochness_sync::SyncEvent;
use lochness_sync::SyncEventSink;
use lochness_sync::SyncServices;
use lochness_sync::SyncSettings;
use lochness_vault::Vault;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Source instance seeded by [`Harness`].
pub const SOURCE: &str = "sim-1";

/// Sink instance seeded by [`Harness`].
pub const SINK: &str = "mem-1";

/// Change item `id` produced at `millis`.
pub fn item(id: &str, millis: i64) -> ChangeItem {
    ChangeItem {
        external_id: ExternalId::new(id),
        payload: Payload::json(format!("{{\"record_id\":\"{id}\",\"at\":{millis}}}").into_bytes()),
        produced_at: Timestamp::from_unix_millis(millis),
        subject_id: Some(SubjectId::new("S-1")),
    }
}

/// Watermark of item `id` produced at `millis`.
pub fn mark(id: &str, millis: i64) -> Watermark {
    Watermark::at(Timestamp::from_unix_millis(millis), ExternalId::new(id))
}

/// Settings with millisecond backoff.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        retry: RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        checkpoint_interval: 1,
        max_in_flight: 100,
        max_cursor_restarts: 2,
    }
}

/// Source instance id used by the harness.
pub fn source_id() -> SourceInstanceId {
    SourceInstanceId::new(SOURCE)
}

// ============================================================================
// SECTION: Events
// ============================================================================

/// Event sink keeping every event in memory.
#[derive(Default)]
pub struct RecordingEvents {
    /// Emitted events.
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEvents {
    /// Returns the labels of every event in order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(SyncEvent::label).collect()
    }

    /// Returns every event in order.
    pub fn all(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl SyncEventSink for RecordingEvents {
    fn emit(&self, event: &SyncEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ============================================================================
// SECTION: Harness
// ============================================================================

/// Seeded stores, vault, and memory backends.
pub struct Harness {
    /// Catalog.
    pub catalog: Arc<dyn CatalogStore>,
    /// Checkpoints and ledgers.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Run history.
    pub runs: Arc<dyn SyncRunStore>,
    /// Unlocked vault.
    pub vault: Arc<Vault>,
    /// Memory feeds and objects.
    pub memory: MemoryBackends,
    /// Recorded events.
    pub events: Arc<RecordingEvents>,
}

impl Harness {
    /// Seeds a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::with_store(lochness_core::InMemoryStore::new())
    }

    /// Seeds `store`, which backs every store trait.
    pub fn with_store<S>(store: S) -> Self
    where
        S: CatalogStore + CheckpointStore + SyncRunStore + CredentialRecordStore + Clone + 'static,
    {
        let harness = Self::open(store);
        seed_catalog(harness.catalog.as_ref());
        harness.vault.store(&InstanceRef::new(format!("{SOURCE}-cred")), b"{}").unwrap();
        harness.vault.store(&InstanceRef::new(format!("{SINK}-cred")), b"{}").unwrap();
        harness
    }

    /// Wraps an already seeded `store`.
    pub fn open<S>(store: S) -> Self
    where
        S: CatalogStore + CheckpointStore + SyncRunStore + CredentialRecordStore + Clone + 'static,
    {
        let kdf = KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        };
        let vault = Vault::unlock(Arc::new(store.clone()), b"correct horse", kdf).unwrap();
        Self {
            catalog: Arc::new(store.clone()),
            checkpoints: Arc::new(store.clone()),
            runs: Arc::new(store),
            vault: Arc::new(vault),
            memory: MemoryBackends::default(),
            events: Arc::new(RecordingEvents::default()),
        }
    }

    /// Registry with every built-in connector over the harness memory backends.
    pub fn builtin_registry(&self) -> ConnectorRegistry {
        ConnectorRegistry::with_builtin_connectors(&ConnectorOptions::default(), &self.memory).unwrap()
    }

    /// Registry whose `memory` sink runs `hook` before every write.
    pub fn registry_with_sink_hook(&self, hook: SinkHook) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register_source("memory", MemorySourceFactory::new(self.memory.feeds.clone())).unwrap();
        registry
            .register_sink(
                "memory",
                HookedSinkFactory {
                    objects: self.memory.objects.clone(),
                    hook,
                },
            )
            .unwrap();
        registry
    }

    /// Registry whose `memory` source replays `script` verbatim.
    pub fn registry_with_script(&self, script: Script) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register_source("memory", ScriptedSourceFactory { script }).unwrap();
        registry
            .register_sink(
                "memory",
                HookedSinkFactory {
                    objects: self.memory.objects.clone(),
                    hook: Arc::new(|_| Ok(())),
                },
            )
            .unwrap();
        registry
    }

    /// Orchestrator over the harness stores.
    pub fn orchestrator(&self, registry: ConnectorRegistry, settings: SyncSettings) -> Orchestrator {
        Orchestrator::new(
            SyncServices {
                catalog: Arc::clone(&self.catalog),
                checkpoints: Arc::clone(&self.checkpoints),
                runs: Arc::clone(&self.runs),
                vault: Arc::clone(&self.vault),
                registry: Arc::new(registry),
                events: Arc::clone(&self.events) as Arc<dyn SyncEventSink>,
            },
            settings,
        )
    }

    /// Pushes items onto the `sim-1` feed.
    pub fn push(&self, items: &[ChangeItem]) {
        self.push_to(SOURCE, items);
    }

    /// Pushes items onto the feed named `feed`.
    pub fn push_to(&self, feed: &str, items: &[ChangeItem]) {
        let feed = self.memory.feeds.feed(feed);
        for item in items {
            feed.push(item.clone());
        }
    }

    /// Adds an active memory source `id` reading feed `id` into `mem-1`.
    pub fn add_source(&self, id: &str) -> SourceInstanceId {
        let instance = SourceInstanceId::new(id);
        self.catalog
            .create_source_instance(&DataSourceInstance {
                id: instance.clone(),
                project: ProjectId::new("lab"),
                site: SiteId::new("boston"),
                connector: SourceMetadata::Memory(MemorySourceMetadata {
                    feed: Some(id.to_string()),
                }),
                credential_ref: InstanceRef::new(format!("{id}-cred")),
                sink: Some(SinkInstanceId::new(SINK)),
                active: true,
            })
            .unwrap();
        self.vault.store(&InstanceRef::new(format!("{id}-cred")), b"{}").unwrap();
        instance
    }

    /// Returns the stored object keys.
    pub fn object_keys(&self) -> Vec<String> {
        self.memory.objects.keys()
    }
}

/// Creates project `lab`, site `boston`, `sim-1`, and `mem-1`.
fn seed_catalog(catalog: &dyn CatalogStore) {
    catalog
        .create_project(&Project {
            id: ProjectId::new("lab"),
            name: "Lab".to_string(),
            metadata: BTreeMap::new(),
        })
        .unwrap();
    catalog
        .create_site(&Site {
            id: SiteId::new("boston"),
            project: ProjectId::new("lab"),
            name: "Boston".to_string(),
            metadata: BTreeMap::new(),
        })
        .unwrap();
    catalog
        .create_sink_instance(&DataSinkInstance {
            id: SinkInstanceId::new(SINK),
            project: ProjectId::new("lab"),
            site: SiteId::new("boston"),
            connector: SinkMetadata::Memory(MemorySinkMetadata {
                prefix: None,
            }),
            credential_ref: InstanceRef::new(format!("{SINK}-cred")),
        })
        .unwrap();
    catalog
        .create_source_instance(&DataSourceInstance {
            id: SourceInstanceId::new(SOURCE),
            project: ProjectId::new("lab"),
            site: SiteId::new("boston"),
            connector: SourceMetadata::Memory(MemorySourceMetadata {
                feed: Some(SOURCE.to_string()),
            }),
            credential_ref: InstanceRef::new(format!("{SOURCE}-cred")),
            sink: Some(SinkInstanceId::new(SINK)),
            active: true,
        })
        .unwrap();
}

// ============================================================================
// SECTION: Hooked Sink
// ============================================================================

/// Callback run before every write; an error fails that attempt.
pub type SinkHook = Arc<dyn Fn(&ObjectKey) -> Result<(), ConnectorError> + Send + Sync>;

/// Hook failing the first `failures` writes of keys ending in `/{id}`.
pub fn fail_times(id: &str, failures: u32, error: ConnectorError) -> SinkHook {
    let suffix = format!("/{id}");
    let remaining = Mutex::new(failures);
    Arc::new(move |key| {
        if !key.as_str().ends_with(&suffix) {
            return Ok(());
        }
        let mut remaining = remaining.lock().unwrap();
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        Err(error.clone())
    })
}

/// Memory sink that consults a hook first.
struct HookedSinkFactory {
    /// Shared objects.
    objects: MemoryObjects,
    /// Pre-write hook.
    hook: SinkHook,
}

impl SinkFactory for HookedSinkFactory {
    fn descriptor(&self) -> DataSinkType {
        SinkMetadata::descriptors().into_iter().find(|descriptor| descriptor.name.as_str() == "memory").unwrap()
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn build(&self, _instance: &DataSinkInstance) -> Result<Box<dyn SinkConnector>, ConnectorError> {
        Ok(Box::new(HookedSink {
            inner: MemorySink::new(self.objects.clone()),
            hook: Arc::clone(&self.hook),
        }))
    }
}

/// Sink built by [`HookedSinkFactory`].
struct HookedSink {
    /// Delegate.
    inner: MemorySink,
    /// Pre-write hook.
    hook: SinkHook,
}

#[async_trait]
impl SinkConnector for HookedSink {
    async fn put(
        &self,
        key: &ObjectKey,
        payload: &Payload,
        context: &ObjectContext,
        credential: &Secret,
    ) -> Result<PutAck, ConnectorError> {
        (self.hook)(key)?;
        self.inner.put(key, payload, context, credential).await
    }
}

// ============================================================================
// SECTION: Scripted Source
// ============================================================================

/// One step of a scripted stream.
#[derive(Clone)]
pub enum Step {
    /// Yield this item when it is after the requested watermark.
    Item(ChangeItem),
    /// Fail this call once, then continue with the next step.
    Fail(ConnectorError),
}

/// Streams handed out by a scripted source, one per `list_changes` call.
#[derive(Clone, Default)]
pub struct Script {
    /// Remaining stream scripts; the last one repeats.
    passes: Arc<Mutex<VecDeque<Vec<Step>>>>,
    /// Watermarks requested by each `list_changes` call.
    requested: Arc<Mutex<Vec<Watermark>>>,
}

impl Script {
    /// Adds the script for the next `list_changes` call.
    pub fn pass(self, steps: Vec<Step>) -> Self {
        self.passes.lock().unwrap().push_back(steps);
        self
    }

    /// Returns the watermark of every `list_changes` call so far.
    pub fn requested(&self) -> Vec<Watermark> {
        self.requested.lock().unwrap().clone()
    }
}

/// Source factory replaying a [`Script`].
struct ScriptedSourceFactory {
    /// Shared script.
    script: Script,
}

impl SourceFactory for ScriptedSourceFactory {
    fn descriptor(&self) -> DataSourceType {
        SourceMetadata::descriptors().into_iter().find(|descriptor| descriptor.name.as_str() == "memory").unwrap()
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn build(&self, _instance: &DataSourceInstance) -> Result<Box<dyn SourceConnector>, ConnectorError> {
        Ok(Box::new(ScriptedSource {
            script: self.script.clone(),
        }))
    }
}

/// Source built by [`ScriptedSourceFactory`].
struct ScriptedSource {
    /// Shared script.
    script: Script,
}

#[async_trait]
impl SourceConnector for ScriptedSource {
    async fn list_changes(
        &self,
        since: &Watermark,
        _credential: &Secret,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError> {
        self.script.requested.lock().unwrap().push(since.clone());
        let mut passes = self.script.passes.lock().unwrap();
        let steps = if passes.len() > 1 {
            passes.pop_front().unwrap()
        } else {
            passes.front().cloned().unwrap_or_default()
        };
        drop(passes);
        let steps = steps
            .into_iter()
            .filter(|step| match step {
                Step::Item(item) => item.watermark() > *since,
                Step::Fail(_) => true,
            })
            .collect();
        Ok(Box::new(ScriptedStream {
            steps,
        }))
    }
}

/// Stream replaying steps in order.
struct ScriptedStream {
    /// Remaining steps.
    steps: VecDeque<Step>,
}

#[async_trait]
impl ChangeStream for ScriptedStream {
    async fn next_item(&mut self, _credential: &Secret) -> Result<Option<ChangeItem>, ConnectorError> {
        match self.steps.pop_front() {
            None => Ok(None),
            Some(Step::Item(item)) => Ok(Some(item)),
            Some(Step::Fail(error)) => Err(error),
        }
    }
}
