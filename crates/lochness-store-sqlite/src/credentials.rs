// crates/lochness-store-sqlite/src/credentials.rs
// ============================================================================
// Module: SQLite Credential Records
// Description: Ciphertext and vault key metadata persistence.
// Purpose: Implement CredentialRecordStore with a single active version per reference.
// Dependencies: lochness-core, rusqlite
// ============================================================================

//! ## Overview
//! Only ciphertext, nonces, tags, and key-derivation parameters reach this
//! table set. A partial unique index keeps at most one active row per
//! instance reference; inserts deactivate the previous version in the same
//! transaction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use lochness_core::CredentialRecord;
use lochness_core::CredentialRecordStore;
use lochness_core::InstanceRef;
use lochness_core::KdfParams;
use lochness_core::StoreError;
use lochness_core::Timestamp;
use lochness_core::VaultMeta;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;

use crate::store::SqliteStore;
use crate::store::SqliteStoreError;

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Column list shared by every credential query.
const CREDENTIAL_COLUMNS: &str =
    "instance_ref, version, nonce, ciphertext, tag, algorithm, active, created_at";

/// Raw `credentials` row before validation.
struct CredentialRow {
    instance_ref: String,
    version: i64,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
    algorithm: String,
    active: i64,
    created_at: i64,
}

impl CredentialRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_ref: row.get(0)?,
            version: row.get(1)?,
            nonce: row.get(2)?,
            ciphertext: row.get(3)?,
            tag: row.get(4)?,
            algorithm: row.get(5)?,
            active: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<CredentialRecord, SqliteStoreError> {
        let version = u32::try_from(self.version).map_err(|_| {
            SqliteStoreError::Corrupt(format!("credential version {} out of range", self.version))
        })?;
        Ok(CredentialRecord {
            instance_ref: InstanceRef::new(self.instance_ref),
            version,
            nonce: self.nonce,
            ciphertext: self.ciphertext,
            tag: self.tag,
            algorithm: self.algorithm,
            active: self.active != 0,
            created_at: Timestamp::from_unix_millis(self.created_at),
        })
    }
}

/// Converts a stored KDF parameter.
fn kdf_param(value: i64, field: &str) -> Result<u32, SqliteStoreError> {
    u32::try_from(value)
        .map_err(|_| SqliteStoreError::Corrupt(format!("vault {field} out of range: {value}")))
}

// ============================================================================
// SECTION: Credential Record Store
// ============================================================================

impl CredentialRecordStore for SqliteStore {
    fn load_vault_meta(&self) -> Result<Option<VaultMeta>, StoreError> {
        type MetaRow = (Vec<u8>, i64, i64, i64, String, Vec<u8>, Vec<u8>, i64);
        let row: Option<MetaRow> = {
            let guard = self.lock()?;
            guard
                .query_row(
                    "SELECT salt, memory_kib, iterations, parallelism, algorithm, probe_nonce, \
                     probe_ciphertext, created_at FROM vault_meta WHERE id = 1",
                    params![],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )
                .optional()
                .map_err(SqliteStoreError::from)?
        };
        let Some((salt, memory, iterations, parallelism, algorithm, nonce, probe, created)) = row
        else {
            return Ok(None);
        };
        Ok(Some(VaultMeta {
            salt,
            kdf: KdfParams {
                memory_kib: kdf_param(memory, "memory_kib")?,
                iterations: kdf_param(iterations, "iterations")?,
                parallelism: kdf_param(parallelism, "parallelism")?,
            },
            algorithm,
            probe_nonce: nonce,
            probe_ciphertext: probe,
            created_at: Timestamp::from_unix_millis(created),
        }))
    }

    fn init_vault_meta(&self, meta: &VaultMeta) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let inserted = guard.execute(
            "INSERT INTO vault_meta (id, salt, memory_kib, iterations, parallelism, algorithm, \
             probe_nonce, probe_ciphertext, created_at) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                meta.salt,
                i64::from(meta.kdf.memory_kib),
                i64::from(meta.kdf.iterations),
                i64::from(meta.kdf.parallelism),
                meta.algorithm,
                meta.probe_nonce,
                meta.probe_ciphertext,
                meta.created_at.as_unix_millis()
            ],
        );
        drop(guard);
        match inserted.map_err(SqliteStoreError::from) {
            Ok(_) => Ok(()),
            Err(SqliteStoreError::Conflict(_)) => {
                Err(StoreError::Conflict("vault metadata already initialized".to_string()))
            }
            Err(other) => Err(other.into()),
        }
    }

    fn insert_credential(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(SqliteStoreError::from)?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT version FROM credentials WHERE instance_ref = ?1 AND version = ?2",
                params![record.instance_ref.as_str(), i64::from(record.version)],
                |row| row.get(0),
            )
            .optional()
            .map_err(SqliteStoreError::from)?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!(
                "credential {} version {} already exists",
                record.instance_ref, record.version
            )));
        }
        if record.active {
            tx.execute(
                "UPDATE credentials SET active = 0 WHERE instance_ref = ?1 AND active = 1",
                params![record.instance_ref.as_str()],
            )
            .map_err(SqliteStoreError::from)?;
        }
        tx.execute(
            "INSERT INTO credentials (instance_ref, version, nonce, ciphertext, tag, algorithm, \
             active, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.instance_ref.as_str(),
                i64::from(record.version),
                record.nonce,
                record.ciphertext,
                record.tag,
                record.algorithm,
                i64::from(record.active),
                record.created_at.as_unix_millis()
            ],
        )
        .map_err(SqliteStoreError::from)?;
        tx.commit().map_err(SqliteStoreError::from)?;
        drop(guard);
        Ok(())
    }

    fn load_credential(
        &self,
        instance_ref: &InstanceRef,
        version: u32,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let row = {
            let guard = self.lock()?;
            guard
                .query_row(
                    &format!(
                        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE instance_ref = ?1 AND \
                         version = ?2"
                    ),
                    params![instance_ref.as_str(), i64::from(version)],
                    CredentialRow::read,
                )
                .optional()
                .map_err(SqliteStoreError::from)?
        };
        Ok(row.map(CredentialRow::into_record).transpose()?)
    }

    fn load_active_credential(
        &self,
        instance_ref: &InstanceRef,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let row = {
            let guard = self.lock()?;
            guard
                .query_row(
                    &format!(
                        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE instance_ref = ?1 AND \
                         active = 1"
                    ),
                    params![instance_ref.as_str()],
                    CredentialRow::read,
                )
                .optional()
                .map_err(SqliteStoreError::from)?
        };
        Ok(row.map(CredentialRow::into_record).transpose()?)
    }

    fn list_credentials(
        &self,
        instance_ref: &InstanceRef,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let rows = {
            let guard = self.lock()?;
            let mut statement = guard
                .prepare(&format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE instance_ref = ?1 ORDER \
                     BY version"
                ))
                .map_err(SqliteStoreError::from)?;
            let mapped = statement
                .query_map(params![instance_ref.as_str()], CredentialRow::read)
                .map_err(SqliteStoreError::from)?;
            mapped.collect::<Result<Vec<CredentialRow>, _>>().map_err(SqliteStoreError::from)?
        };
        let records =
            rows.into_iter().map(CredentialRow::into_record).collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
