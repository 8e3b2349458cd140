// crates/lochness-store-sqlite/src/catalog.rs
// ============================================================================
// Module: SQLite Catalog
// Description: Projects, sites, subjects, connector types, and instances.
// Purpose: Implement CatalogStore with parent checks and typed metadata reloads.
// Dependencies: lochness-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! Instance metadata is stored as the untagged JSON body next to its
//! connector type name and re-parsed through the typed metadata constructors
//! on load, so a row edited out of band fails validation instead of reaching
//! a connector.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use lochness_core::CatalogError;
use lochness_core::CatalogStore;
use lochness_core::ConnectorType;
use lochness_core::DataSinkInstance;
use lochness_core::DataSinkType;
use lochness_core::DataSourceInstance;
use lochness_core::DataSourceType;
use lochness_core::InstanceRef;
use lochness_core::Project;
use lochness_core::ProjectId;
use lochness_core::SinkInstanceId;
use lochness_core::SinkMetadata;
use lochness_core::Site;
use lochness_core::SiteId;
use lochness_core::SourceInstanceId;
use lochness_core::SourceMetadata;
use lochness_core::StoreError;
use lochness_core::Subject;
use lochness_core::SubjectId;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::store::SqliteStore;
use crate::store::SqliteStoreError;

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Column list shared by source instance queries.
const SOURCE_COLUMNS: &str =
    "id, project_id, site_id, connector_type, metadata_json, credential_ref, sink_id, active";
/// Column list shared by sink instance queries.
const SINK_COLUMNS: &str = "id, project_id, site_id, connector_type, metadata_json, credential_ref";

/// Raw `source_instances` row.
struct SourceRow {
    id: String,
    project_id: String,
    site_id: String,
    connector_type: String,
    metadata_json: String,
    credential_ref: String,
    sink_id: Option<String>,
    active: i64,
}

impl SourceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            site_id: row.get(2)?,
            connector_type: row.get(3)?,
            metadata_json: row.get(4)?,
            credential_ref: row.get(5)?,
            sink_id: row.get(6)?,
            active: row.get(7)?,
        })
    }

    fn into_instance(self) -> Result<DataSourceInstance, CatalogError> {
        let metadata = parse_json(&self.metadata_json, "source metadata")?;
        Ok(DataSourceInstance {
            id: SourceInstanceId::new(self.id),
            project: ProjectId::new(self.project_id),
            site: SiteId::new(self.site_id),
            connector: SourceMetadata::from_parts(&self.connector_type, metadata)?,
            credential_ref: InstanceRef::new(self.credential_ref),
            sink: self.sink_id.map(SinkInstanceId::new),
            active: self.active != 0,
        })
    }
}

/// Raw `sink_instances` row.
struct SinkRow {
    id: String,
    project_id: String,
    site_id: String,
    connector_type: String,
    metadata_json: String,
    credential_ref: String,
}

impl SinkRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            site_id: row.get(2)?,
            connector_type: row.get(3)?,
            metadata_json: row.get(4)?,
            credential_ref: row.get(5)?,
        })
    }

    fn into_instance(self) -> Result<DataSinkInstance, CatalogError> {
        let metadata = parse_json(&self.metadata_json, "sink metadata")?;
        Ok(DataSinkInstance {
            id: SinkInstanceId::new(self.id),
            project: ProjectId::new(self.project_id),
            site: SiteId::new(self.site_id),
            connector: SinkMetadata::from_parts(&self.connector_type, metadata)?,
            credential_ref: InstanceRef::new(self.credential_ref),
        })
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Maps engine failures into catalog errors.
fn db(error: rusqlite::Error) -> CatalogError {
    CatalogError::from(StoreError::from(SqliteStoreError::from(error)))
}

/// Serializes a value stored as JSON text.
fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, CatalogError> {
    serde_json::to_string(value)
        .map_err(|err| CatalogError::InvalidMetadata(format!("{what}: {err}")))
}

/// Parses JSON text loaded from the database.
fn parse_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T, CatalogError> {
    serde_json::from_str(raw).map_err(|err| CatalogError::Storage(format!("corrupt {what}: {err}")))
}

/// Returns true when the (project, site) pair exists.
fn site_exists(
    connection: &Connection,
    project: &ProjectId,
    site: &SiteId,
) -> Result<bool, CatalogError> {
    let found: Option<i64> = connection
        .query_row(
            "SELECT 1 FROM sites WHERE project_id = ?1 AND id = ?2",
            params![project.as_str(), site.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db)?;
    Ok(found.is_some())
}

/// Returns true when a row with `id` exists in `table`.
fn id_exists(connection: &Connection, table: &str, id: &str) -> Result<bool, CatalogError> {
    let found: Option<i64> = connection
        .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), params![id], |row| row.get(0))
        .optional()
        .map_err(db)?;
    Ok(found.is_some())
}

/// Loads every row of a type descriptor table.
fn load_types(
    connection: &Connection,
    table: &str,
) -> Result<Vec<(ConnectorType, BTreeMap<String, String>)>, CatalogError> {
    let mut statement =
        connection.prepare(&format!("SELECT name, fields_json FROM {table} ORDER BY name")).map_err(db)?;
    let rows = statement
        .query_map(params![], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(db)?
        .collect::<Result<Vec<(String, String)>, _>>()
        .map_err(db)?;
    rows.into_iter()
        .map(|(name, fields)| Ok((ConnectorType::new(name), parse_json(&fields, "type fields")?)))
        .collect()
}

// ============================================================================
// SECTION: Type Descriptors
// ============================================================================

impl SqliteStore {
    /// Lists registered source type descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Storage`] on backend failure.
    pub fn source_types(&self) -> Result<Vec<DataSourceType>, CatalogError> {
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        let types = load_types(&guard, "source_types")?;
        drop(guard);
        Ok(types.into_iter().map(|(name, fields)| DataSourceType { name, fields }).collect())
    }

    /// Lists registered sink type descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Storage`] on backend failure.
    pub fn sink_types(&self) -> Result<Vec<DataSinkType>, CatalogError> {
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        let types = load_types(&guard, "sink_types")?;
        drop(guard);
        Ok(types.into_iter().map(|(name, fields)| DataSinkType { name, fields }).collect())
    }
}

// ============================================================================
// SECTION: Catalog Store
// ============================================================================

impl CatalogStore for SqliteStore {
    fn create_project(&self, project: &Project) -> Result<(), CatalogError> {
        let metadata = to_json(&project.metadata, "project metadata")?;
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        if id_exists(&guard, "projects", project.id.as_str())? {
            return Err(CatalogError::Duplicate(format!("project {}", project.id)));
        }
        guard
            .execute(
                "INSERT INTO projects (id, name, metadata_json) VALUES (?1, ?2, ?3)",
                params![project.id.as_str(), project.name, metadata],
            )
            .map_err(db)?;
        drop(guard);
        Ok(())
    }

    fn create_site(&self, site: &Site) -> Result<(), CatalogError> {
        let metadata = to_json(&site.metadata, "site metadata")?;
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        if !id_exists(&guard, "projects", site.project.as_str())? {
            return Err(CatalogError::NotFound(format!("project {}", site.project)));
        }
        if site_exists(&guard, &site.project, &site.id)? {
            return Err(CatalogError::Duplicate(format!("site {}", site.id)));
        }
        guard
            .execute(
                "INSERT INTO sites (project_id, id, name, metadata_json) VALUES (?1, ?2, ?3, ?4)",
                params![site.project.as_str(), site.id.as_str(), site.name, metadata],
            )
            .map_err(db)?;
        drop(guard);
        Ok(())
    }

    fn create_subject(&self, subject: &Subject) -> Result<(), CatalogError> {
        let metadata = to_json(&subject.metadata, "subject metadata")?;
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        if !site_exists(&guard, &subject.project, &subject.site)? {
            return Err(CatalogError::NotFound(format!("site {}", subject.site)));
        }
        guard
            .execute(
                "INSERT INTO subjects (project_id, site_id, id, metadata_json) VALUES (?1, ?2, \
                 ?3, ?4)",
                params![
                    subject.project.as_str(),
                    subject.site.as_str(),
                    subject.id.as_str(),
                    metadata
                ],
            )
            .map_err(|err| match db(err) {
                CatalogError::Duplicate(_) => {
                    CatalogError::Duplicate(format!("subject {}", subject.id))
                }
                other => other,
            })?;
        drop(guard);
        Ok(())
    }

    fn list_subjects(
        &self,
        project: &ProjectId,
        site: &SiteId,
    ) -> Result<Vec<Subject>, CatalogError> {
        let rows = {
            let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
            let mut statement = guard
                .prepare(
                    "SELECT id, metadata_json FROM subjects WHERE project_id = ?1 AND site_id = \
                     ?2 ORDER BY id",
                )
                .map_err(db)?;
            let mapped = statement
                .query_map(params![project.as_str(), site.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(db)?;
            mapped.collect::<Result<Vec<(String, String)>, _>>().map_err(db)?
        };
        rows.into_iter()
            .map(|(id, metadata)| {
                Ok(Subject {
                    id: SubjectId::new(id),
                    project: project.clone(),
                    site: site.clone(),
                    metadata: parse_json(&metadata, "subject metadata")?,
                })
            })
            .collect()
    }

    fn register_source_type(&self, descriptor: &DataSourceType) -> Result<(), CatalogError> {
        let fields = to_json(&descriptor.fields, "type fields")?;
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        guard
            .execute(
                "INSERT INTO source_types (name, fields_json) VALUES (?1, ?2) ON CONFLICT(name) \
                 DO UPDATE SET fields_json = excluded.fields_json",
                params![descriptor.name.as_str(), fields],
            )
            .map_err(db)?;
        drop(guard);
        Ok(())
    }

    fn register_sink_type(&self, descriptor: &DataSinkType) -> Result<(), CatalogError> {
        let fields = to_json(&descriptor.fields, "type fields")?;
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        guard
            .execute(
                "INSERT INTO sink_types (name, fields_json) VALUES (?1, ?2) ON CONFLICT(name) DO \
                 UPDATE SET fields_json = excluded.fields_json",
                params![descriptor.name.as_str(), fields],
            )
            .map_err(db)?;
        drop(guard);
        Ok(())
    }

    fn create_source_instance(&self, instance: &DataSourceInstance) -> Result<(), CatalogError> {
        instance.validate()?;
        let metadata = to_json(&instance.connector.body()?, "source metadata")?;
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        if !site_exists(&guard, &instance.project, &instance.site)? {
            return Err(CatalogError::NotFound(format!("site {}", instance.site)));
        }
        if let Some(sink) = &instance.sink
            && !id_exists(&guard, "sink_instances", sink.as_str())?
        {
            return Err(CatalogError::NotFound(format!("sink instance {sink}")));
        }
        if id_exists(&guard, "source_instances", instance.id.as_str())? {
            return Err(CatalogError::Duplicate(format!("source instance {}", instance.id)));
        }
        guard
            .execute(
                "INSERT INTO source_instances (id, project_id, site_id, connector_type, \
                 metadata_json, credential_ref, sink_id, active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, \
                 ?7, ?8)",
                params![
                    instance.id.as_str(),
                    instance.project.as_str(),
                    instance.site.as_str(),
                    instance.connector.connector_type().as_str(),
                    metadata,
                    instance.credential_ref.as_str(),
                    instance.sink.as_ref().map(SinkInstanceId::as_str),
                    i64::from(instance.active)
                ],
            )
            .map_err(db)?;
        drop(guard);
        Ok(())
    }

    fn create_sink_instance(&self, instance: &DataSinkInstance) -> Result<(), CatalogError> {
        instance.validate()?;
        let metadata = to_json(&instance.connector.body()?, "sink metadata")?;
        let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
        if !site_exists(&guard, &instance.project, &instance.site)? {
            return Err(CatalogError::NotFound(format!("site {}", instance.site)));
        }
        if id_exists(&guard, "sink_instances", instance.id.as_str())? {
            return Err(CatalogError::Duplicate(format!("sink instance {}", instance.id)));
        }
        guard
            .execute(
                "INSERT INTO sink_instances (id, project_id, site_id, connector_type, \
                 metadata_json, credential_ref) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    instance.id.as_str(),
                    instance.project.as_str(),
                    instance.site.as_str(),
                    instance.connector.connector_type().as_str(),
                    metadata,
                    instance.credential_ref.as_str()
                ],
            )
            .map_err(db)?;
        drop(guard);
        Ok(())
    }

    fn source_instance(&self, id: &SourceInstanceId) -> Result<DataSourceInstance, CatalogError> {
        let row = {
            let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
            guard
                .query_row(
                    &format!("SELECT {SOURCE_COLUMNS} FROM source_instances WHERE id = ?1"),
                    params![id.as_str()],
                    SourceRow::read,
                )
                .optional()
                .map_err(db)?
        };
        row.ok_or_else(|| CatalogError::NotFound(format!("source instance {id}")))?
            .into_instance()
    }

    fn sink_instance(&self, id: &SinkInstanceId) -> Result<DataSinkInstance, CatalogError> {
        let row = {
            let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
            guard
                .query_row(
                    &format!("SELECT {SINK_COLUMNS} FROM sink_instances WHERE id = ?1"),
                    params![id.as_str()],
                    SinkRow::read,
                )
                .optional()
                .map_err(db)?
        };
        row.ok_or_else(|| CatalogError::NotFound(format!("sink instance {id}")))?.into_instance()
    }

    fn list_source_instances(
        &self,
        active_only: bool,
    ) -> Result<Vec<DataSourceInstance>, CatalogError> {
        let rows = {
            let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
            let mut statement = guard
                .prepare(&format!(
                    "SELECT {SOURCE_COLUMNS} FROM source_instances WHERE (?1 = 0 OR active = 1) \
                     ORDER BY id"
                ))
                .map_err(db)?;
            let mapped =
                statement.query_map(params![i64::from(active_only)], SourceRow::read).map_err(db)?;
            mapped.collect::<Result<Vec<SourceRow>, _>>().map_err(db)?
        };
        rows.into_iter().map(SourceRow::into_instance).collect()
    }

    fn list_sink_instances(
        &self,
        project: &ProjectId,
        site: &SiteId,
    ) -> Result<Vec<DataSinkInstance>, CatalogError> {
        let rows = {
            let guard = self.lock().map_err(|err| CatalogError::from(StoreError::from(err)))?;
            let mut statement = guard
                .prepare(&format!(
                    "SELECT {SINK_COLUMNS} FROM sink_instances WHERE project_id = ?1 AND site_id \
                     = ?2 ORDER BY id"
                ))
                .map_err(db)?;
            let mapped = statement
                .query_map(params![project.as_str(), site.as_str()], SinkRow::read)
                .map_err(db)?;
            mapped.collect::<Result<Vec<SinkRow>, _>>().map_err(db)?
        };
        rows.into_iter().map(SinkRow::into_instance).collect()
    }
}
