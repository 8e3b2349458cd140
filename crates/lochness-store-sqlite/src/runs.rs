// crates/lochness-store-sqlite/src/runs.rs
// ============================================================================
// Module: SQLite Run History
// Description: Append-only sync run records.
// Purpose: Implement SyncRunStore with at-most-one in-progress run per instance.
// Dependencies: lochness-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! A partial unique index on `outcome = 'in_progress'` backs the single
//! running-run rule; `finish` only touches rows still in progress, so a
//! completed run is never rewritten.

// ============================================================================
// SECTION: Imports
// ============================================================================

use lochness_core::RunCounters;
use lochness_core::RunErrorDetail;
use lochness_core::RunOutcome;
use lochness_core::SourceInstanceId;
use lochness_core::StoreError;
use lochness_core::SyncRun;
use lochness_core::SyncRunId;
use lochness_core::SyncRunStore;
use lochness_core::Timestamp;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;

use crate::checkpoints::parse_watermark;
use crate::store::SqliteStore;
use crate::store::SqliteStoreError;
use crate::store::from_sql_int;
use crate::store::to_sql_int;

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Column list shared by every run query.
const RUN_COLUMNS: &str = "id, instance_id, started_at, finished_at, outcome, error_json, \
                           fetched, written, unchanged, watermark";

/// Raw `sync_runs` row before validation.
struct RunRow {
    id: String,
    instance_id: String,
    started_at: i64,
    finished_at: Option<i64>,
    outcome: String,
    error_json: Option<String>,
    fetched: i64,
    written: i64,
    unchanged: i64,
    watermark: Option<String>,
}

impl RunRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            instance_id: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            outcome: row.get(4)?,
            error_json: row.get(5)?,
            fetched: row.get(6)?,
            written: row.get(7)?,
            unchanged: row.get(8)?,
            watermark: row.get(9)?,
        })
    }

    fn into_run(self) -> Result<SyncRun, SqliteStoreError> {
        let outcome = RunOutcome::parse(&self.outcome).ok_or_else(|| {
            SqliteStoreError::Corrupt(format!("unknown run outcome {}", self.outcome))
        })?;
        let error = self
            .error_json
            .map(|raw| serde_json::from_str::<RunErrorDetail>(&raw))
            .transpose()
            .map_err(|err| SqliteStoreError::Corrupt(format!("run error detail: {err}")))?;
        let watermark = self.watermark.as_deref().map(parse_watermark).transpose()?;
        Ok(SyncRun {
            id: SyncRunId::new(self.id),
            instance: SourceInstanceId::new(self.instance_id),
            started_at: Timestamp::from_unix_millis(self.started_at),
            finished_at: self.finished_at.map(Timestamp::from_unix_millis),
            outcome,
            error,
            counters: RunCounters {
                fetched: from_sql_int(self.fetched, "fetched")?,
                written: from_sql_int(self.written, "written")?,
                unchanged: from_sql_int(self.unchanged, "unchanged")?,
            },
            watermark,
        })
    }
}

/// Serializes the optional failure detail.
fn error_json(run: &SyncRun) -> Result<Option<String>, SqliteStoreError> {
    run.error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| SqliteStoreError::Invalid(format!("run error detail: {err}")))
}

// ============================================================================
// SECTION: Sync Run Store
// ============================================================================

impl SyncRunStore for SqliteStore {
    fn begin(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(SqliteStoreError::from)?;
        let running: Option<String> = tx
            .query_row(
                "SELECT id FROM sync_runs WHERE instance_id = ?1 AND outcome = 'in_progress'",
                params![run.instance.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(SqliteStoreError::from)?;
        if let Some(running) = running {
            return Err(StoreError::Conflict(format!(
                "instance {} already has in-progress run {running}",
                run.instance
            )));
        }
        let inserted = tx.execute(
            "INSERT INTO sync_runs (id, instance_id, started_at, finished_at, outcome, \
             error_json, fetched, written, unchanged, watermark) VALUES (?1, ?2, ?3, ?4, ?5, ?6, \
             ?7, ?8, ?9, ?10)",
            params![
                run.id.as_str(),
                run.instance.as_str(),
                run.started_at.as_unix_millis(),
                run.finished_at.map(Timestamp::as_unix_millis),
                run.outcome.as_str(),
                error_json(run)?,
                to_sql_int(run.counters.fetched, "fetched")?,
                to_sql_int(run.counters.written, "written")?,
                to_sql_int(run.counters.unchanged, "unchanged")?,
                run.watermark.as_ref().map(ToString::to_string)
            ],
        );
        match inserted.map_err(SqliteStoreError::from) {
            Ok(_) => {}
            Err(SqliteStoreError::Conflict(_)) => {
                return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
            }
            Err(other) => return Err(other.into()),
        }
        tx.commit().map_err(SqliteStoreError::from)?;
        drop(guard);
        Ok(())
    }

    fn finish(&self, run: &SyncRun) -> Result<(), StoreError> {
        if !run.outcome.is_terminal() {
            return Err(StoreError::Invalid("finish requires a terminal outcome".to_string()));
        }
        let guard = self.lock()?;
        let updated = guard
            .execute(
                "UPDATE sync_runs SET finished_at = ?2, outcome = ?3, error_json = ?4, fetched = \
                 ?5, written = ?6, unchanged = ?7, watermark = ?8 WHERE id = ?1 AND outcome = \
                 'in_progress'",
                params![
                    run.id.as_str(),
                    run.finished_at.map(Timestamp::as_unix_millis),
                    run.outcome.as_str(),
                    error_json(run)?,
                    to_sql_int(run.counters.fetched, "fetched")?,
                    to_sql_int(run.counters.written, "written")?,
                    to_sql_int(run.counters.unchanged, "unchanged")?,
                    run.watermark.as_ref().map(ToString::to_string)
                ],
            )
            .map_err(SqliteStoreError::from)?;
        drop(guard);
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "run {} is unknown or already finished",
                run.id
            )));
        }
        Ok(())
    }

    fn get_run(&self, id: &SyncRunId) -> Result<Option<SyncRun>, StoreError> {
        let row = {
            let guard = self.lock()?;
            guard
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
                    params![id.as_str()],
                    RunRow::read,
                )
                .optional()
                .map_err(SqliteStoreError::from)?
        };
        Ok(row.map(RunRow::into_run).transpose()?)
    }

    fn list_runs(
        &self,
        instance: &SourceInstanceId,
        limit: usize,
    ) -> Result<Vec<SyncRun>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = {
            let guard = self.lock()?;
            let mut statement = guard
                .prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM sync_runs WHERE instance_id = ?1 ORDER BY \
                     started_at DESC, rowid DESC LIMIT ?2"
                ))
                .map_err(SqliteStoreError::from)?;
            let mapped = statement
                .query_map(params![instance.as_str(), limit], RunRow::read)
                .map_err(SqliteStoreError::from)?;
            mapped.collect::<Result<Vec<RunRow>, _>>().map_err(SqliteStoreError::from)?
        };
        let runs = rows.into_iter().map(RunRow::into_run).collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn abandon_in_progress(&self, at: Timestamp) -> Result<Vec<SyncRunId>, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(SqliteStoreError::from)?;
        let ids = {
            let mut statement = tx
                .prepare("SELECT id FROM sync_runs WHERE outcome = 'in_progress' ORDER BY rowid")
                .map_err(SqliteStoreError::from)?;
            let mapped =
                statement.query_map(params![], |row| row.get(0)).map_err(SqliteStoreError::from)?;
            mapped.collect::<Result<Vec<String>, _>>().map_err(SqliteStoreError::from)?
        };
        tx.execute(
            "UPDATE sync_runs SET outcome = 'abandoned', finished_at = ?1 WHERE outcome = \
             'in_progress'",
            params![at.as_unix_millis()],
        )
        .map_err(SqliteStoreError::from)?;
        tx.commit().map_err(SqliteStoreError::from)?;
        drop(guard);
        Ok(ids.into_iter().map(SyncRunId::new).collect())
    }
}
