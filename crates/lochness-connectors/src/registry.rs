// crates/lochness-connectors/src/registry.rs
// ============================================================================
// Module: Connector Registry
// Description: Maps connector type names to source and sink factories.
// Purpose: Resolve catalog instances into live connectors.
// Dependencies: lochness-core, serde, thiserror
// ============================================================================

//! ## Overview
//! The registry keeps separate source and sink factory maps keyed by the
//! connector type name stored on catalog instances. Factories describe their
//! metadata schema and the credential fields they need, so credentials can be
//! validated before they are sealed into the vault.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use lochness_core::ConnectorError;
use lochness_core::DataSinkInstance;
use lochness_core::DataSinkType;
use lochness_core::DataSourceInstance;
use lochness_core::DataSourceType;
use lochness_core::Secret;
use lochness_core::SinkConnector;
use lochness_core::SourceConnector;
use serde::Deserialize;
use thiserror::Error;

use crate::http::HttpOptions;
use crate::sinks::AzureBlobSinkFactory;
use crate::sinks::MemoryObjects;
use crate::sinks::MemorySinkFactory;
use crate::sinks::S3SinkFactory;
use crate::sources::MemoryFeeds;
use crate::sources::MemorySourceFactory;
use crate::sources::RedcapSourceFactory;
use crate::sources::SharepointEndpoints;
use crate::sources::SharepointSourceFactory;
use crate::sources::XnatSourceFactory;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No factory is registered under the type name.
    #[error("unknown connector type: {0}")]
    UnknownType(String),
    /// A factory is already registered under the type name.
    #[error("connector type already registered: {0}")]
    Duplicate(String),
    /// The instance could not be turned into a connector.
    #[error("cannot build connector: {0}")]
    Build(#[from] ConnectorError),
}

// ============================================================================
// SECTION: Factories
// ============================================================================

/// Builds source connectors for one connector type.
pub trait SourceFactory: Send + Sync {
    /// Returns the declared metadata schema.
    fn descriptor(&self) -> DataSourceType;

    /// Returns the credential JSON fields the connector reads.
    fn credential_fields(&self) -> &'static [&'static str];

    /// Checks that a credential carries what the connector needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] naming the first missing field.
    fn validate_credential(&self, credential: &Secret) -> Result<(), ConnectorError> {
        credential.require_fields(self.credential_fields())?;
        Ok(())
    }

    /// Builds a connector for a catalog instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] when the instance metadata does not match
    /// this factory's type or the client cannot be built.
    fn build(&self, instance: &DataSourceInstance) -> Result<Box<dyn SourceConnector>, ConnectorError>;
}

/// Builds sink connectors for one connector type.
pub trait SinkFactory: Send + Sync {
    /// Returns the declared metadata schema.
    fn descriptor(&self) -> DataSinkType;

    /// Returns the credential JSON fields the connector reads.
    fn credential_fields(&self) -> &'static [&'static str];

    /// Checks that a credential carries what the connector needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] naming the first missing or unusable field.
    fn validate_credential(&self, credential: &Secret) -> Result<(), ConnectorError> {
        credential.require_fields(self.credential_fields())?;
        Ok(())
    }

    /// Builds a connector for a catalog instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] when the instance metadata does not match
    /// this factory's type or the client cannot be built.
    fn build(&self, instance: &DataSinkInstance) -> Result<Box<dyn SinkConnector>, ConnectorError>;
}

// ============================================================================
// SECTION: Options
// ============================================================================

/// Settings for the built-in connectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectorOptions {
    /// HTTP client settings.
    pub http: HttpOptions,
    /// Microsoft identity and Graph base URLs.
    pub sharepoint: SharepointEndpoints,
}

/// Process-local backends shared by the in-memory connectors.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackends {
    /// Named change feeds read by `memory` sources.
    pub feeds: MemoryFeeds,
    /// Object map written by `memory` sinks.
    pub objects: MemoryObjects,
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Connector factories keyed by type name.
///
/// # Invariants
/// - Type names are unique within each map.
#[derive(Default)]
pub struct ConnectorRegistry {
    /// Source factories by type name.
    sources: BTreeMap<String, Box<dyn SourceFactory>>,
    /// Sink factories by type name.
    sinks: BTreeMap<String, Box<dyn SinkFactory>>,
}

impl ConnectorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in connector registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Build`] when the HTTP client cannot be created.
    pub fn with_builtin_connectors(
        options: &ConnectorOptions,
        memory: &MemoryBackends,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register_source("redcap", RedcapSourceFactory::new(&options.http)?)?;
        registry.register_source("xnat", XnatSourceFactory::new(&options.http)?)?;
        registry.register_source(
            "sharepoint",
            SharepointSourceFactory::new(&options.http, options.sharepoint.clone())?,
        )?;
        registry.register_source("memory", MemorySourceFactory::new(memory.feeds.clone()))?;
        registry.register_sink("s3", S3SinkFactory::new())?;
        registry.register_sink("azure_blob", AzureBlobSinkFactory::new(&options.http)?)?;
        registry.register_sink("memory", MemorySinkFactory::new(memory.objects.clone()))?;
        Ok(registry)
    }

    /// Registers a source factory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] when the name is taken.
    pub fn register_source(
        &mut self,
        type_name: impl Into<String>,
        factory: impl SourceFactory + 'static,
    ) -> Result<(), RegistryError> {
        let type_name = type_name.into();
        if self.sources.contains_key(&type_name) {
            return Err(RegistryError::Duplicate(type_name));
        }
        self.sources.insert(type_name, Box::new(factory));
        Ok(())
    }

    /// Registers a sink factory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] when the name is taken.
    pub fn register_sink(
        &mut self,
        type_name: impl Into<String>,
        factory: impl SinkFactory + 'static,
    ) -> Result<(), RegistryError> {
        let type_name = type_name.into();
        if self.sinks.contains_key(&type_name) {
            return Err(RegistryError::Duplicate(type_name));
        }
        self.sinks.insert(type_name, Box::new(factory));
        Ok(())
    }

    /// Resolves a source factory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownType`] when nothing is registered.
    pub fn resolve_source(&self, type_name: &str) -> Result<&dyn SourceFactory, RegistryError> {
        self.sources
            .get(type_name)
            .map(|factory| &**factory)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))
    }

    /// Resolves a sink factory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownType`] when nothing is registered.
    pub fn resolve_sink(&self, type_name: &str) -> Result<&dyn SinkFactory, RegistryError> {
        self.sinks
            .get(type_name)
            .map(|factory| &**factory)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))
    }

    /// Builds the source connector for a catalog instance.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for unknown types or build failures.
    pub fn source_for(
        &self,
        instance: &DataSourceInstance,
    ) -> Result<Box<dyn SourceConnector>, RegistryError> {
        let factory = self.resolve_source(instance.connector.connector_type().as_str())?;
        Ok(factory.build(instance)?)
    }

    /// Builds the sink connector for a catalog instance.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for unknown types or build failures.
    pub fn sink_for(&self, instance: &DataSinkInstance) -> Result<Box<dyn SinkConnector>, RegistryError> {
        let factory = self.resolve_sink(instance.connector.connector_type().as_str())?;
        Ok(factory.build(instance)?)
    }

    /// Returns every registered source descriptor.
    #[must_use]
    pub fn source_descriptors(&self) -> Vec<DataSourceType> {
        self.sources.values().map(|factory| factory.descriptor()).collect()
    }

    /// Returns every registered sink descriptor.
    #[must_use]
    pub fn sink_descriptors(&self) -> Vec<DataSinkType> {
        self.sinks.values().map(|factory| factory.descriptor()).collect()
    }
}
