// crates/lochness-core/src/core/catalog.rs
// ============================================================================
// Module: Lochness Catalog Model
// Description: Projects, sites, subjects, and typed connector instances.
// Purpose: Describe what is synchronized and validate it at creation time.
// Dependencies: serde, serde_json, url
// ============================================================================

//! ## Overview
//! The catalog is a hierarchy of projects, sites, and subjects plus the
//! data-source and data-sink instances attached to each (project, site).
//! Instance metadata is a tagged variant per connector type; each variant is
//! a struct that rejects unknown fields, so malformed instances fail when they
//! are created rather than when a sync runs.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::core::identifiers::ConnectorType;
use crate::core::identifiers::InstanceRef;
use crate::core::identifiers::ProjectId;
use crate::core::identifiers::SinkInstanceId;
use crate::core::identifiers::SiteId;
use crate::core::identifiers::SourceInstanceId;
use crate::core::identifiers::SubjectId;
use crate::interfaces::CatalogError;

// ============================================================================
// SECTION: Hierarchy
// ============================================================================

/// Research project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    /// Project identifier.
    pub id: ProjectId,
    /// Display name.
    pub name: String,
    /// Free-form project metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Recruitment site within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Site {
    /// Site identifier.
    pub id: SiteId,
    /// Owning project.
    pub project: ProjectId,
    /// Display name.
    pub name: String,
    /// Free-form site metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Study participant within a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Subject {
    /// Subject identifier.
    pub id: SubjectId,
    /// Owning project.
    pub project: ProjectId,
    /// Owning site.
    pub site: SiteId,
    /// Free-form subject metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ============================================================================
// SECTION: Connector Type Descriptors
// ============================================================================

/// Declared schema of a data-source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceType {
    /// Type name keying the connector registry.
    pub name: ConnectorType,
    /// Required metadata field names mapped to descriptions.
    pub fields: BTreeMap<String, String>,
}

/// Declared schema of a data-sink type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSinkType {
    /// Type name keying the connector registry.
    pub name: ConnectorType,
    /// Required metadata field names mapped to descriptions.
    pub fields: BTreeMap<String, String>,
}

/// Builds a field description map from static pairs.
fn describe(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(name, description)| ((*name).to_string(), (*description).to_string())).collect()
}

// ============================================================================
// SECTION: Source Metadata
// ============================================================================

/// REDCap project connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedcapMetadata {
    /// REDCap API endpoint (`https://redcap.example.org/api/`).
    pub endpoint_url: String,
    /// Record id field of the project; `record_id` when absent.
    #[serde(default)]
    pub record_id_field: Option<String>,
    /// Field holding the subject id; defaults to the record id.
    #[serde(default)]
    pub subject_id_variable: Option<String>,
    /// Records exported per request.
    #[serde(default)]
    pub batch_size: Option<u32>,
}

/// XNAT project connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XnatMetadata {
    /// XNAT base URL.
    pub endpoint_url: String,
    /// XNAT project id.
    pub project: String,
    /// Fetch the zipped scan archive instead of experiment JSON.
    #[serde(default)]
    pub include_archive: bool,
}

/// SharePoint document library settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharepointMetadata {
    /// Site URL (`https://tenant.sharepoint.com/sites/Study`).
    pub site_url: String,
    /// Document library (drive) display name.
    pub drive_name: String,
    /// Folder path inside the drive; root when absent.
    #[serde(default)]
    pub folder_path: Option<String>,
}

/// In-process source settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySourceMetadata {
    /// Name of the shared in-memory feed.
    #[serde(default)]
    pub feed: Option<String>,
}

/// Typed data-source metadata, one variant per connector type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "metadata", rename_all = "snake_case")]
pub enum SourceMetadata {
    /// REDCap forms.
    Redcap(RedcapMetadata),
    /// XNAT imaging repository.
    Xnat(XnatMetadata),
    /// SharePoint document library.
    Sharepoint(SharepointMetadata),
    /// In-process feed.
    Memory(MemorySourceMetadata),
}

impl SourceMetadata {
    /// Returns the connector type name.
    #[must_use]
    pub fn connector_type(&self) -> ConnectorType {
        ConnectorType::new(match self {
            Self::Redcap(_) => "redcap",
            Self::Xnat(_) => "xnat",
            Self::Sharepoint(_) => "sharepoint",
            Self::Memory(_) => "memory",
        })
    }

    /// Parses untyped metadata for a named connector type.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownType`] for unrecognized types and
    /// [`CatalogError::InvalidMetadata`] for missing, unknown, or malformed fields.
    pub fn from_parts(connector_type: &str, metadata: Value) -> Result<Self, CatalogError> {
        let parsed = match connector_type {
            "redcap" => serde_json::from_value(metadata).map(Self::Redcap),
            "xnat" => serde_json::from_value(metadata).map(Self::Xnat),
            "sharepoint" => serde_json::from_value(metadata).map(Self::Sharepoint),
            "memory" => serde_json::from_value(metadata).map(Self::Memory),
            other => return Err(CatalogError::UnknownType(other.to_string())),
        };
        let parsed = parsed.map_err(|err| {
            CatalogError::InvalidMetadata(format!("{connector_type} metadata: {err}"))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Returns the metadata body without the type tag.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidMetadata`] when serialization fails.
    pub fn body(&self) -> Result<Value, CatalogError> {
        let result = match self {
            Self::Redcap(inner) => serde_json::to_value(inner),
            Self::Xnat(inner) => serde_json::to_value(inner),
            Self::Sharepoint(inner) => serde_json::to_value(inner),
            Self::Memory(inner) => serde_json::to_value(inner),
        };
        result.map_err(|err| CatalogError::InvalidMetadata(err.to_string()))
    }

    /// Validates field contents beyond their shape.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidMetadata`] describing the first bad field.
    pub fn validate(&self) -> Result<(), CatalogError> {
        match self {
            Self::Redcap(meta) => {
                validate_url("endpoint_url", &meta.endpoint_url)?;
                if let Some(field) = &meta.record_id_field {
                    require_non_empty("record_id_field", field)?;
                }
                if let Some(variable) = &meta.subject_id_variable {
                    require_non_empty("subject_id_variable", variable)?;
                }
                if meta.batch_size == Some(0) {
                    return Err(CatalogError::InvalidMetadata(
                        "batch_size must be greater than zero".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Xnat(meta) => {
                validate_url("endpoint_url", &meta.endpoint_url)?;
                require_non_empty("project", &meta.project)
            }
            Self::Sharepoint(meta) => {
                validate_url("site_url", &meta.site_url)?;
                require_non_empty("drive_name", &meta.drive_name)
            }
            Self::Memory(_) => Ok(()),
        }
    }

    /// Returns the declared schema of every source type.
    #[must_use]
    pub fn descriptors() -> Vec<DataSourceType> {
        vec![
            DataSourceType {
                name: ConnectorType::new("redcap"),
                fields: describe(&[
                    ("endpoint_url", "REDCap API endpoint URL"),
                    ("record_id_field", "optional record id field, default record_id"),
                    ("subject_id_variable", "optional field holding the subject id"),
                    ("batch_size", "optional number of records exported per request"),
                ]),
            },
            DataSourceType {
                name: ConnectorType::new("xnat"),
                fields: describe(&[
                    ("endpoint_url", "XNAT base URL"),
                    ("project", "XNAT project id"),
                    ("include_archive", "optional; fetch zipped scan files"),
                ]),
            },
            DataSourceType {
                name: ConnectorType::new("sharepoint"),
                fields: describe(&[
                    ("site_url", "SharePoint site URL"),
                    ("drive_name", "document library name"),
                    ("folder_path", "optional folder inside the library"),
                ]),
            },
            DataSourceType {
                name: ConnectorType::new("memory"),
                fields: describe(&[("feed", "optional in-process feed name")]),
            },
        ]
    }
}

// ============================================================================
// SECTION: Sink Metadata
// ============================================================================

/// S3-compatible bucket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Metadata {
    /// Bucket name.
    pub bucket: String,
    /// Region; `us-east-1` when absent.
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint (MinIO and other S3-compatible stores).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Use path-style addressing.
    #[serde(default)]
    pub force_path_style: bool,
}

/// Azure Blob container settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureBlobMetadata {
    /// Container name.
    pub container: String,
    /// Blob name prefix.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// In-process sink settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySinkMetadata {
    /// Key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Typed data-sink metadata, one variant per connector type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "metadata", rename_all = "snake_case")]
pub enum SinkMetadata {
    /// S3-compatible object storage.
    S3(S3Metadata),
    /// Azure Blob storage.
    AzureBlob(AzureBlobMetadata),
    /// In-process object map.
    Memory(MemorySinkMetadata),
}

impl SinkMetadata {
    /// Returns the connector type name.
    #[must_use]
    pub fn connector_type(&self) -> ConnectorType {
        ConnectorType::new(match self {
            Self::S3(_) => "s3",
            Self::AzureBlob(_) => "azure_blob",
            Self::Memory(_) => "memory",
        })
    }

    /// Returns the configured key prefix.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        match self {
            Self::S3(meta) => meta.prefix.as_deref(),
            Self::AzureBlob(meta) => meta.prefix.as_deref(),
            Self::Memory(meta) => meta.prefix.as_deref(),
        }
    }

    /// Parses untyped metadata for a named connector type.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownType`] for unrecognized types and
    /// [`CatalogError::InvalidMetadata`] for missing, unknown, or malformed fields.
    pub fn from_parts(connector_type: &str, metadata: Value) -> Result<Self, CatalogError> {
        let parsed = match connector_type {
            "s3" => serde_json::from_value(metadata).map(Self::S3),
            "azure_blob" => serde_json::from_value(metadata).map(Self::AzureBlob),
            "memory" => serde_json::from_value(metadata).map(Self::Memory),
            other => return Err(CatalogError::UnknownType(other.to_string())),
        };
        let parsed = parsed.map_err(|err| {
            CatalogError::InvalidMetadata(format!("{connector_type} metadata: {err}"))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Returns the metadata body without the type tag.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidMetadata`] when serialization fails.
    pub fn body(&self) -> Result<Value, CatalogError> {
        let result = match self {
            Self::S3(inner) => serde_json::to_value(inner),
            Self::AzureBlob(inner) => serde_json::to_value(inner),
            Self::Memory(inner) => serde_json::to_value(inner),
        };
        result.map_err(|err| CatalogError::InvalidMetadata(err.to_string()))
    }

    /// Validates field contents beyond their shape.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidMetadata`] describing the first bad field.
    pub fn validate(&self) -> Result<(), CatalogError> {
        match self {
            Self::S3(meta) => {
                validate_bucket_name(&meta.bucket)?;
                if let Some(endpoint) = &meta.endpoint {
                    validate_url("endpoint", endpoint)?;
                }
                if let Some(region) = &meta.region {
                    require_non_empty("region", region)?;
                }
                Ok(())
            }
            Self::AzureBlob(meta) => validate_bucket_name(&meta.container),
            Self::Memory(_) => Ok(()),
        }
    }

    /// Returns the declared schema of every sink type.
    #[must_use]
    pub fn descriptors() -> Vec<DataSinkType> {
        vec![
            DataSinkType {
                name: ConnectorType::new("s3"),
                fields: describe(&[
                    ("bucket", "bucket name"),
                    ("region", "optional region, default us-east-1"),
                    ("endpoint", "optional S3-compatible endpoint URL"),
                    ("prefix", "optional key prefix"),
                    ("force_path_style", "optional; use path-style addressing"),
                ]),
            },
            DataSinkType {
                name: ConnectorType::new("azure_blob"),
                fields: describe(&[
                    ("container", "blob container name"),
                    ("prefix", "optional blob name prefix"),
                ]),
            },
            DataSinkType {
                name: ConnectorType::new("memory"),
                fields: describe(&[("prefix", "optional key prefix")]),
            },
        ]
    }
}

// ============================================================================
// SECTION: Instances
// ============================================================================

/// One configured external data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSourceInstance {
    /// Instance identifier.
    pub id: SourceInstanceId,
    /// Owning project.
    pub project: ProjectId,
    /// Owning site.
    pub site: SiteId,
    /// Typed connector metadata.
    pub connector: SourceMetadata,
    /// Vault reference of the source credential.
    pub credential_ref: InstanceRef,
    /// Explicit destination; the (project, site) sink when absent.
    #[serde(default)]
    pub sink: Option<SinkInstanceId>,
    /// Inactive instances are never scheduled.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl DataSourceInstance {
    /// Validates identifiers and metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidMetadata`] for empty identifiers or bad metadata.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_empty("id", self.id.as_str())?;
        require_non_empty("credential_ref", self.credential_ref.as_str())?;
        if self.id.as_str().contains('/') {
            return Err(CatalogError::InvalidMetadata("id must not contain '/'".to_string()));
        }
        self.connector.validate()
    }
}

/// One configured external data sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSinkInstance {
    /// Instance identifier.
    pub id: SinkInstanceId,
    /// Owning project.
    pub project: ProjectId,
    /// Owning site.
    pub site: SiteId,
    /// Typed connector metadata.
    pub connector: SinkMetadata,
    /// Vault reference of the sink credential.
    pub credential_ref: InstanceRef,
}

impl DataSinkInstance {
    /// Validates identifiers and metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidMetadata`] for empty identifiers or bad metadata.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_empty("id", self.id.as_str())?;
        require_non_empty("credential_ref", self.credential_ref.as_str())?;
        self.connector.validate()
    }
}

/// Serde default for [`DataSourceInstance::active`].
const fn default_active() -> bool {
    true
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Rejects empty or whitespace-only values.
fn require_non_empty(field: &str, value: &str) -> Result<(), CatalogError> {
    if value.trim().is_empty() {
        return Err(CatalogError::InvalidMetadata(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Requires an absolute `http` or `https` URL.
fn validate_url(field: &str, value: &str) -> Result<(), CatalogError> {
    let url = Url::parse(value)
        .map_err(|err| CatalogError::InvalidMetadata(format!("{field} is not a URL: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => {
            Err(CatalogError::InvalidMetadata(format!("{field} has unsupported scheme {other}")))
        }
    }
}

/// Validates bucket and container names (lowercase, digits, `-`, `.`; 3-63 chars).
fn validate_bucket_name(name: &str) -> Result<(), CatalogError> {
    let valid_chars = name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '.');
    if !(3..=63).contains(&name.len()) || !valid_chars {
        return Err(CatalogError::InvalidMetadata(format!("invalid bucket or container name {name:?}")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, clippy::unwrap_used, reason = "Test-only assertions.")]

    use serde_json::json;

    use super::SinkMetadata;
    use super::SourceMetadata;
    use crate::interfaces::CatalogError;

    #[test]
    fn unknown_metadata_fields_are_rejected() {
        let result = SourceMetadata::from_parts(
            "redcap",
            json!({"endpoint_url": "https://redcap.example.org/api/", "token": "x"}),
        );
        assert!(matches!(result, Err(CatalogError::InvalidMetadata(_))));
    }

    #[test]
    fn missing_metadata_fields_are_rejected() {
        let result = SourceMetadata::from_parts("xnat", json!({"endpoint_url": "https://x.org"}));
        assert!(matches!(result, Err(CatalogError::InvalidMetadata(_))));
    }

    #[test]
    fn unknown_types_are_rejected() {
        let result = SinkMetadata::from_parts("ftp", json!({}));
        assert_eq!(result, Err(CatalogError::UnknownType("ftp".to_string())));
    }

    #[test]
    fn urls_must_be_http() {
        let result = SourceMetadata::from_parts(
            "sharepoint",
            json!({"site_url": "file:///etc/passwd", "drive_name": "Documents"}),
        );
        assert!(matches!(result, Err(CatalogError::InvalidMetadata(_))));
    }

    #[test]
    fn tagged_form_roundtrips_through_parts() {
        let parsed = SinkMetadata::from_parts(
            "s3",
            json!({"bucket": "pronet-raw", "endpoint": "http://minio:9000", "force_path_style": true}),
        )
        .unwrap();
        assert_eq!(parsed.connector_type().as_str(), "s3");
        let reparsed = SinkMetadata::from_parts("s3", parsed.body().unwrap()).unwrap();
        assert_eq!(parsed, reparsed);
        let tagged = serde_json::to_value(&parsed).unwrap();
        assert_eq!(tagged["type"], "s3");
        assert_eq!(tagged["metadata"]["bucket"], "pronet-raw");
    }

    #[test]
    fn bucket_names_are_checked() {
        assert!(SinkMetadata::from_parts("azure_blob", json!({"container": "Bad_Name"})).is_err());
        assert!(SinkMetadata::from_parts("azure_blob", json!({"container": "ok-name"})).is_ok());
    }
}
