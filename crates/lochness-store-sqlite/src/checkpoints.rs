// crates/lochness-store-sqlite/src/checkpoints.rs
// ============================================================================
// Module: SQLite Checkpoint Store
// Description: Durable watermarks and in-flight ledgers per source instance.
// Purpose: Implement CheckpointStore with monotonic, transactional advances.
// Dependencies: lochness-core, rusqlite
// ============================================================================

//! ## Overview
//! Watermarks are stored in their canonical string form; ledger rows split
//! the watermark into `(produced_at, external_id)` columns so range deletes
//! compare the same way [`Watermark`] orders (integer, then byte-wise text).

// ============================================================================
// SECTION: Imports
// ============================================================================

use lochness_core::CheckpointError;
use lochness_core::CheckpointStore;
use lochness_core::ExternalId;
use lochness_core::LedgerEntry;
use lochness_core::LedgerState;
use lochness_core::ObjectKey;
use lochness_core::SourceInstanceId;
use lochness_core::StoreError;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::store::SqliteStore;
use crate::store::SqliteStoreError;

// ============================================================================
// SECTION: Checkpoint Store
// ============================================================================

impl CheckpointStore for SqliteStore {
    fn get(&self, instance: &SourceInstanceId) -> Result<Watermark, CheckpointError> {
        let raw: Option<String> = {
            let guard = self.lock().map_err(storage)?;
            guard
                .query_row(
                    "SELECT watermark FROM checkpoints WHERE instance_id = ?1",
                    params![instance.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| storage(err.into()))?
        };
        let Some(raw) = raw else {
            return Err(CheckpointError::NotFound(instance.clone()));
        };
        parse_watermark(&raw).map_err(storage)
    }

    fn advance(
        &self,
        instance: &SourceInstanceId,
        watermark: &Watermark,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.lock().map_err(storage)?;
        let tx = guard.transaction().map_err(|err| storage(err.into()))?;
        let stored: Option<String> = tx
            .query_row(
                "SELECT watermark FROM checkpoints WHERE instance_id = ?1",
                params![instance.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage(err.into()))?;
        if let Some(stored) = stored {
            let stored = parse_watermark(&stored).map_err(storage)?;
            if *watermark < stored {
                return Err(CheckpointError::Regression {
                    instance: instance.clone(),
                    stored,
                    proposed: watermark.clone(),
                });
            }
            if *watermark == stored {
                return Ok(());
            }
        }
        tx.execute(
            "INSERT INTO checkpoints (instance_id, watermark, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(instance_id) DO UPDATE SET watermark = excluded.watermark, updated_at = \
             excluded.updated_at",
            params![
                instance.as_str(),
                watermark.to_string(),
                Timestamp::now().as_unix_millis()
            ],
        )
        .map_err(|err| storage(err.into()))?;
        delete_ledger_through(&tx, instance, watermark)?;
        tx.commit().map_err(|err| storage(err.into()))?;
        drop(guard);
        Ok(())
    }

    fn record_in_flight(
        &self,
        instance: &SourceInstanceId,
        entry: &LedgerEntry,
    ) -> Result<(), CheckpointError> {
        let guard = self.lock().map_err(storage)?;
        guard
            .execute(
                "INSERT INTO checkpoint_ledger (instance_id, produced_at, external_id, object_key, \
                 state) VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(instance_id, produced_at, \
                 external_id) DO UPDATE SET object_key = excluded.object_key, state = \
                 excluded.state",
                params![
                    instance.as_str(),
                    entry.watermark.produced_at().as_unix_millis(),
                    entry.watermark.external_id().as_str(),
                    entry.key.as_str(),
                    entry.state.as_str()
                ],
            )
            .map_err(|err| storage(err.into()))?;
        drop(guard);
        Ok(())
    }

    fn in_flight(&self, instance: &SourceInstanceId) -> Result<Vec<LedgerEntry>, CheckpointError> {
        let rows: Vec<(i64, String, String, String)> = {
            let guard = self.lock().map_err(storage)?;
            let mut statement = guard
                .prepare(
                    "SELECT produced_at, external_id, object_key, state FROM checkpoint_ledger \
                     WHERE instance_id = ?1 ORDER BY produced_at, external_id",
                )
                .map_err(|err| storage(err.into()))?;
            let mapped = statement
                .query_map(params![instance.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(|err| storage(err.into()))?;
            mapped
                .collect::<Result<Vec<(i64, String, String, String)>, _>>()
                .map_err(|err| storage(err.into()))?
        };
        rows.into_iter()
            .map(|(produced_at, external_id, key, state)| {
                let state = LedgerState::parse(&state).ok_or_else(|| {
                    storage(SqliteStoreError::Corrupt(format!("unknown ledger state {state}")))
                })?;
                Ok(LedgerEntry {
                    watermark: Watermark::at(
                        Timestamp::from_unix_millis(produced_at),
                        ExternalId::new(external_id),
                    ),
                    key: ObjectKey::from_stored(key),
                    state,
                })
            })
            .collect()
    }

    fn clear_in_flight(
        &self,
        instance: &SourceInstanceId,
        up_to: Option<&Watermark>,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.lock().map_err(storage)?;
        let tx = guard.transaction().map_err(|err| storage(err.into()))?;
        match up_to {
            Some(limit) => delete_ledger_through(&tx, instance, limit)?,
            None => {
                tx.execute(
                    "DELETE FROM checkpoint_ledger WHERE instance_id = ?1",
                    params![instance.as_str()],
                )
                .map_err(|err| storage(err.into()))?;
            }
        }
        tx.commit().map_err(|err| storage(err.into()))?;
        drop(guard);
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Deletes ledger rows at or below `watermark`.
fn delete_ledger_through(
    tx: &rusqlite::Transaction<'_>,
    instance: &SourceInstanceId,
    watermark: &Watermark,
) -> Result<(), CheckpointError> {
    tx.execute(
        "DELETE FROM checkpoint_ledger WHERE instance_id = ?1 AND (produced_at < ?2 OR \
         (produced_at = ?2 AND external_id <= ?3))",
        params![
            instance.as_str(),
            watermark.produced_at().as_unix_millis(),
            watermark.external_id().as_str()
        ],
    )
    .map_err(|err| storage(err.into()))?;
    Ok(())
}

/// Parses a stored watermark.
pub(crate) fn parse_watermark(raw: &str) -> Result<Watermark, SqliteStoreError> {
    raw.parse().map_err(|err| SqliteStoreError::Corrupt(format!("stored watermark: {err}")))
}

/// Maps store failures into checkpoint storage errors.
fn storage(error: SqliteStoreError) -> CheckpointError {
    CheckpointError::from(StoreError::from(error))
}
