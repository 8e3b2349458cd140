// crates/lochness-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Store Tests
// Description: Validate SqliteStore against the store contracts.
// Purpose: Pin durability across reopen, checkpoint monotonicity, and catalog rules.
// Dependencies: lochness-store-sqlite, lochness-core, lochness-vault, proptest, tempfile
// ============================================================================

//! ## Overview
//! Each test opens a fresh database file in a temporary directory. Reopening
//! the same path models a process restart.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use lochness_core::CatalogError;
use lochness_core::CatalogStore;
use lochness_core::CheckpointError;
use lochness_core::CheckpointStore;
use lochness_core::DataSinkInstance;
use lochness_core::DataSourceInstance;
use lochness_core::ExternalId;
use lochness_core::InstanceRef;
use lochness_core::KdfParams;
use lochness_core::LedgerEntry;
use lochness_core::LedgerState;
use lochness_core::ObjectKey;
use lochness_core::Project;
use lochness_core::ProjectId;
use lochness_core::RedcapMetadata;
use lochness_core::RunCounters;
use lochness_core::RunErrorDetail;
use lochness_core::RunOutcome;
use lochness_core::S3Metadata;
use lochness_core::SinkInstanceId;
use lochness_core::SinkMetadata;
use lochness_core::Site;
use lochness_core::SiteId;
use lochness_core::SourceInstanceId;
use lochness_core::SourceMetadata;
use lochness_core::StoreError;
use lochness_core::Subject;
use lochness_core::SubjectId;
use lochness_core::SyncRun;
use lochness_core::SyncRunStore;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use lochness_store_sqlite::SqliteStore;
use lochness_store_sqlite::SqliteStoreConfig;
use lochness_store_sqlite::SqliteStoreError;
use lochness_vault::Vault;
use proptest::prelude::*;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

const CHEAP_KDF: KdfParams = KdfParams {
    memory_kib: 64,
    iterations: 1,
    parallelism: 1,
};

fn open(path: &Path) -> SqliteStore {
    SqliteStore::new(&SqliteStoreConfig::at(path)).unwrap()
}

fn temp_store() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("lochness.db"));
    (dir, store)
}

fn mark(millis: i64, id: &str) -> Watermark {
    Watermark::at(Timestamp::from_unix_millis(millis), ExternalId::new(id))
}

fn ledger(watermark: Watermark, state: LedgerState) -> LedgerEntry {
    LedgerEntry {
        key: ObjectKey::from_stored(format!("redcap-ya/{}", watermark.external_id())),
        watermark,
        state,
    }
}

fn seed_site(store: &SqliteStore) {
    store
        .create_project(&Project {
            id: ProjectId::new("Pronet"),
            name: "ProNET".to_string(),
            metadata: BTreeMap::new(),
        })
        .unwrap();
    store
        .create_site(&Site {
            id: SiteId::new("YA"),
            project: ProjectId::new("Pronet"),
            name: "Yale".to_string(),
            metadata: BTreeMap::from([("timezone".to_string(), "America/New_York".to_string())]),
        })
        .unwrap();
}

fn redcap_source(id: &str, sink: Option<&str>) -> DataSourceInstance {
    DataSourceInstance {
        id: SourceInstanceId::new(id),
        project: ProjectId::new("Pronet"),
        site: SiteId::new("YA"),
        connector: SourceMetadata::Redcap(RedcapMetadata {
            endpoint_url: "https://redcap.example.org/api/".to_string(),
            record_id_field: None,
            subject_id_variable: Some("chric_record_id".to_string()),
            batch_size: Some(50),
        }),
        credential_ref: InstanceRef::new(id),
        sink: sink.map(SinkInstanceId::new),
        active: true,
    }
}

fn s3_sink(id: &str) -> DataSinkInstance {
    DataSinkInstance {
        id: SinkInstanceId::new(id),
        project: ProjectId::new("Pronet"),
        site: SiteId::new("YA"),
        connector: SinkMetadata::S3(S3Metadata {
            bucket: "pronet-raw".to_string(),
            region: Some("us-east-1".to_string()),
            endpoint: None,
            prefix: Some("Pronet/YA".to_string()),
            force_path_style: false,
        }),
        credential_ref: InstanceRef::new(id),
    }
}

// ============================================================================
// SECTION: Schema
// ============================================================================

#[test]
fn unsupported_schema_version_fails_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lochness.db");
    drop(open(&path));
    let connection = rusqlite::Connection::open(&path).unwrap();
    connection.execute("UPDATE store_meta SET version = 99", []).unwrap();
    drop(connection);
    let result = SqliteStore::new(&SqliteStoreConfig::at(&path));
    assert!(matches!(result, Err(SqliteStoreError::VersionMismatch(_))));
}

#[test]
fn directory_path_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = SqliteStore::new(&SqliteStoreConfig::at(dir.path()));
    assert!(matches!(result, Err(SqliteStoreError::Invalid(_))));
}

#[test]
fn config_deserializes_with_defaults() {
    let config: SqliteStoreConfig =
        serde_json::from_str(r#"{"path":"/var/lib/lochness/lochness.db"}"#).unwrap();
    assert_eq!(config, SqliteStoreConfig::at("/var/lib/lochness/lochness.db"));
    let unknown = serde_json::from_str::<SqliteStoreConfig>(r#"{"path":"x","extra":1}"#);
    assert!(unknown.is_err());
}

// ============================================================================
// SECTION: Checkpoints
// ============================================================================

#[test]
fn checkpoint_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lochness.db");
    let instance = SourceInstanceId::new("redcap-ya");
    {
        let store = open(&path);
        assert!(matches!(store.get(&instance), Err(CheckpointError::NotFound(_))));
        store.advance(&instance, &mark(1_000, "YA00001")).unwrap();
    }
    let store = open(&path);
    assert_eq!(store.get(&instance).unwrap(), mark(1_000, "YA00001"));
}

#[test]
fn checkpoint_rejects_regression_and_accepts_equal() {
    let (_dir, store) = temp_store();
    let instance = SourceInstanceId::new("redcap-ya");
    store.advance(&instance, &mark(2_000, "b")).unwrap();
    store.advance(&instance, &mark(2_000, "b")).unwrap();
    let err = store.advance(&instance, &mark(2_000, "a")).unwrap_err();
    assert!(matches!(err, CheckpointError::Regression { .. }));
    assert_eq!(store.get(&instance).unwrap(), mark(2_000, "b"));
}

#[test]
fn advance_clears_ledger_through_the_watermark() {
    let (_dir, store) = temp_store();
    let instance = SourceInstanceId::new("xnat-ya");
    for (millis, id) in [(10, "a"), (20, "b"), (20, "c"), (30, "d")] {
        store.record_in_flight(&instance, &ledger(mark(millis, id), LedgerState::Fetched)).unwrap();
    }
    store.record_in_flight(&instance, &ledger(mark(20, "b"), LedgerState::Written)).unwrap();
    store.advance(&instance, &mark(20, "b")).unwrap();

    let remaining = store.in_flight(&instance).unwrap();
    let ids: Vec<&str> =
        remaining.iter().map(|entry| entry.watermark.external_id().as_str()).collect();
    assert_eq!(ids, vec!["c", "d"]);
    assert!(remaining.iter().all(|entry| entry.state == LedgerState::Fetched));

    store.clear_in_flight(&instance, None).unwrap();
    assert!(store.in_flight(&instance).unwrap().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn persisted_checkpoint_never_decreases(
        values in proptest::collection::vec((0i64..50, 0u8..3), 1..20)
    ) {
        let (_dir, store) = temp_store();
        let instance = SourceInstanceId::new("redcap-ya");
        let mut highest: Option<Watermark> = None;
        for (millis, suffix) in values {
            let proposed = mark(millis, &format!("id-{suffix}"));
            let result = store.advance(&instance, &proposed);
            match &highest {
                Some(current) if proposed < *current => prop_assert!(result.is_err()),
                _ => {
                    prop_assert!(result.is_ok());
                    highest = Some(proposed);
                }
            }
            prop_assert_eq!(store.get(&instance).ok(), highest.clone());
        }
    }
}

#[test]
fn ledger_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lochness.db");
    let instance = SourceInstanceId::new("sp-ya");
    {
        let store = open(&path);
        store.record_in_flight(&instance, &ledger(mark(5, "x"), LedgerState::Written)).unwrap();
    }
    let entries = open(&path).in_flight(&instance).unwrap();
    assert_eq!(entries, vec![ledger(mark(5, "x"), LedgerState::Written)]);
}

// ============================================================================
// SECTION: Run History
// ============================================================================

#[test]
fn second_in_progress_run_is_rejected() {
    let (_dir, store) = temp_store();
    let instance = SourceInstanceId::new("redcap-ya");
    let first = SyncRun::start(instance.clone(), Timestamp::from_unix_millis(1));
    store.begin(&first).unwrap();
    let second = SyncRun::start(instance.clone(), Timestamp::from_unix_millis(2));
    assert!(matches!(store.begin(&second), Err(StoreError::Conflict(_))));

    let other = SyncRun::start(SourceInstanceId::new("xnat-ya"), Timestamp::from_unix_millis(2));
    store.begin(&other).unwrap();
}

#[test]
fn finished_runs_round_trip_and_are_immutable() {
    let (_dir, store) = temp_store();
    let instance = SourceInstanceId::new("redcap-ya");
    let run = SyncRun::start(instance.clone(), Timestamp::from_unix_millis(100));
    store.begin(&run).unwrap();

    let mut finished = run.clone().finish(
        RunOutcome::Failed,
        Timestamp::from_unix_millis(200),
        Some(RunErrorDetail {
            kind: "permanent".to_string(),
            message: "403 forbidden".to_string(),
            external_id: Some(ExternalId::new("YA00002")),
            attempts: 1,
        }),
    );
    finished.counters = RunCounters {
        fetched: 3,
        written: 1,
        unchanged: 1,
    };
    finished.watermark = Some(mark(50, "YA00001"));
    store.finish(&finished).unwrap();
    assert_eq!(store.get_run(&run.id).unwrap(), Some(finished.clone()));

    let again = finished.clone().finish(RunOutcome::Succeeded, Timestamp::from_unix_millis(300), None);
    assert!(matches!(store.finish(&again), Err(StoreError::Conflict(_))));
    let in_progress = SyncRun::start(instance, Timestamp::from_unix_millis(400));
    assert!(matches!(store.finish(&in_progress), Err(StoreError::Invalid(_))));
}

#[test]
fn runs_list_newest_first_with_limit() {
    let (_dir, store) = temp_store();
    let instance = SourceInstanceId::new("redcap-ya");
    let mut ids = Vec::new();
    for started in [10, 20, 30] {
        let run = SyncRun::start(instance.clone(), Timestamp::from_unix_millis(started));
        store.begin(&run).unwrap();
        let done = run.clone().finish(
            RunOutcome::Succeeded,
            Timestamp::from_unix_millis(started + 1),
            None,
        );
        store.finish(&done).unwrap();
        ids.push(run.id);
    }
    let listed: Vec<_> =
        store.list_runs(&instance, 2).unwrap().into_iter().map(|run| run.id).collect();
    assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);
}

#[test]
fn abandon_marks_runs_left_by_a_dead_process() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lochness.db");
    let run = SyncRun::start(SourceInstanceId::new("redcap-ya"), Timestamp::from_unix_millis(1));
    open(&path).begin(&run).unwrap();

    let store = open(&path);
    let abandoned = store.abandon_in_progress(Timestamp::from_unix_millis(9)).unwrap();
    assert_eq!(abandoned, vec![run.id.clone()]);
    let stored = store.get_run(&run.id).unwrap().unwrap();
    assert_eq!(stored.outcome, RunOutcome::Abandoned);
    assert_eq!(stored.finished_at, Some(Timestamp::from_unix_millis(9)));
    assert!(store.abandon_in_progress(Timestamp::from_unix_millis(10)).unwrap().is_empty());
}

// ============================================================================
// SECTION: Credentials
// ============================================================================

#[test]
fn vault_over_sqlite_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lochness.db");
    let reference = InstanceRef::new("redcap-ya");
    {
        let vault = Vault::unlock(Arc::new(open(&path)), b"operator pass", CHEAP_KDF).unwrap();
        vault.store(&reference, br#"{"api_token":"v1"}"#).unwrap();
        vault.rotate(&reference, br#"{"api_token":"v2"}"#).unwrap();
    }
    let vault = Vault::unlock(Arc::new(open(&path)), b"operator pass", CHEAP_KDF).unwrap();
    assert_eq!(vault.acquire(&reference).unwrap().field("api_token").unwrap().as_str(), "v2");
    let versions = vault.versions(&reference).unwrap();
    assert_eq!(versions.iter().map(|version| version.reference.version).collect::<Vec<_>>(), vec![
        1, 2
    ]);
    assert!(Vault::unlock(Arc::new(open(&path)), b"wrong", CHEAP_KDF).is_err());
}

// ============================================================================
// SECTION: Catalog
// ============================================================================

#[test]
fn typed_instances_round_trip() {
    let (_dir, store) = temp_store();
    seed_site(&store);
    store.create_sink_instance(&s3_sink("s3-ya")).unwrap();
    store.create_source_instance(&redcap_source("redcap-ya", None)).unwrap();

    assert_eq!(store.source_instance(&SourceInstanceId::new("redcap-ya")).unwrap(), redcap_source(
        "redcap-ya",
        None
    ));
    let source = store.source_instance(&SourceInstanceId::new("redcap-ya")).unwrap();
    assert_eq!(store.sink_for(&source).unwrap(), s3_sink("s3-ya"));
}

#[test]
fn catalog_enforces_parents_and_uniqueness() {
    let (_dir, store) = temp_store();
    let orphan = Site {
        id: SiteId::new("YA"),
        project: ProjectId::new("Nope"),
        name: "Yale".to_string(),
        metadata: BTreeMap::new(),
    };
    assert!(matches!(store.create_site(&orphan), Err(CatalogError::NotFound(_))));
    assert!(matches!(
        store.create_source_instance(&redcap_source("redcap-ya", None)),
        Err(CatalogError::NotFound(_))
    ));

    seed_site(&store);
    assert!(matches!(
        store.create_source_instance(&redcap_source("redcap-ya", Some("missing"))),
        Err(CatalogError::NotFound(_))
    ));
    store.create_source_instance(&redcap_source("redcap-ya", None)).unwrap();
    assert!(matches!(
        store.create_source_instance(&redcap_source("redcap-ya", None)),
        Err(CatalogError::Duplicate(_))
    ));

    let subject = Subject {
        id: SubjectId::new("YA00001"),
        project: ProjectId::new("Pronet"),
        site: SiteId::new("YA"),
        metadata: BTreeMap::new(),
    };
    store.create_subject(&subject).unwrap();
    assert!(matches!(store.create_subject(&subject), Err(CatalogError::Duplicate(_))));
    assert_eq!(
        store.list_subjects(&ProjectId::new("Pronet"), &SiteId::new("YA")).unwrap(),
        vec![subject]
    );
}

#[test]
fn invalid_metadata_is_rejected_before_insert() {
    let (_dir, store) = temp_store();
    seed_site(&store);
    let mut sink = s3_sink("s3-ya");
    sink.connector = SinkMetadata::S3(S3Metadata {
        bucket: "Bad_Bucket".to_string(),
        region: None,
        endpoint: None,
        prefix: None,
        force_path_style: false,
    });
    assert!(matches!(store.create_sink_instance(&sink), Err(CatalogError::InvalidMetadata(_))));
    assert!(store.list_sink_instances(&ProjectId::new("Pronet"), &SiteId::new("YA")).unwrap().is_empty());
}

#[test]
fn ambiguous_sinks_require_an_explicit_binding() {
    let (_dir, store) = temp_store();
    seed_site(&store);
    store.create_sink_instance(&s3_sink("s3-a")).unwrap();
    store.create_sink_instance(&s3_sink("s3-b")).unwrap();
    store.create_source_instance(&redcap_source("redcap-ya", None)).unwrap();
    store.create_source_instance(&redcap_source("redcap-yb", Some("s3-b"))).unwrap();

    let unbound = store.source_instance(&SourceInstanceId::new("redcap-ya")).unwrap();
    assert!(matches!(store.sink_for(&unbound), Err(CatalogError::InvalidMetadata(_))));
    let bound = store.source_instance(&SourceInstanceId::new("redcap-yb")).unwrap();
    assert_eq!(store.sink_for(&bound).unwrap().id, SinkInstanceId::new("s3-b"));
}

#[test]
fn inactive_sources_are_filtered() {
    let (_dir, store) = temp_store();
    seed_site(&store);
    store.create_source_instance(&redcap_source("redcap-ya", None)).unwrap();
    let mut paused = redcap_source("redcap-paused", None);
    paused.active = false;
    store.create_source_instance(&paused).unwrap();

    assert_eq!(store.list_source_instances(false).unwrap().len(), 2);
    let active = store.list_source_instances(true).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, SourceInstanceId::new("redcap-ya"));
}

#[test]
fn type_descriptors_are_replaced_on_reregistration() {
    let (_dir, store) = temp_store();
    for descriptor in SourceMetadata::descriptors() {
        store.register_source_type(&descriptor).unwrap();
        store.register_source_type(&descriptor).unwrap();
    }
    for descriptor in SinkMetadata::descriptors() {
        store.register_sink_type(&descriptor).unwrap();
    }
    assert_eq!(store.source_types().unwrap().len(), SourceMetadata::descriptors().len());
    assert_eq!(store.sink_types().unwrap().len(), SinkMetadata::descriptors().len());
}
