// crates/lochness-connectors/src/sinks/memory.rs
// ============================================================================
// Module: In-Memory Sink
// Description: Process-local object map.
// Purpose: Capture written objects for dry runs and tests.
// Dependencies: lochness-core
// ============================================================================

//! ## Overview
//! Objects live in a shared map keyed by object key. Every `memory` sink
//! built from the same [`MemoryObjects`] writes into the same map.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use lochness_core::ConnectorError;
use lochness_core::DataSinkInstance;
use lochness_core::DataSinkType;
use lochness_core::ObjectContext;
use lochness_core::ObjectKey;
use lochness_core::Payload;
use lochness_core::PutAck;
use lochness_core::Secret;
use lochness_core::SinkConnector;
use lochness_core::SinkMetadata;

use crate::registry::SinkFactory;
use crate::sinks::descriptor_named;
use crate::sinks::wrong_metadata;

// ============================================================================
// SECTION: Objects
// ============================================================================

/// One stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object content.
    pub bytes: Vec<u8>,
    /// Content digest.
    pub digest: String,
    /// MIME type.
    pub content_type: String,
    /// Catalog context metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Shared object map.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjects {
    /// Objects by key.
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
}

impl MemoryObjects {
    /// Returns a copy of the object stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Returns every stored key in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// Sink writing into a [`MemoryObjects`] map.
pub struct MemorySink {
    /// Backing map.
    objects: MemoryObjects,
}

impl MemorySink {
    /// Creates a sink over `objects`.
    #[must_use]
    pub const fn new(objects: MemoryObjects) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl SinkConnector for MemorySink {
    async fn put(
        &self,
        key: &ObjectKey,
        payload: &Payload,
        context: &ObjectContext,
        _credential: &Secret,
    ) -> Result<PutAck, ConnectorError> {
        let digest = payload.digest();
        let mut objects = self.objects.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if objects.get(key.as_str()).is_some_and(|stored| stored.digest == digest) {
            return Ok(PutAck {
                key: key.clone(),
                digest,
                written: false,
            });
        }
        let metadata = context
            .metadata_pairs()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        objects.insert(
            key.as_str().to_string(),
            StoredObject {
                bytes: payload.bytes.clone(),
                digest: digest.clone(),
                content_type: payload.content_type.clone(),
                metadata,
            },
        );
        drop(objects);
        Ok(PutAck {
            key: key.clone(),
            digest,
            written: true,
        })
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Factory for `memory` sinks.
pub struct MemorySinkFactory {
    /// Shared map.
    objects: MemoryObjects,
}

impl MemorySinkFactory {
    /// Creates a factory over `objects`.
    #[must_use]
    pub const fn new(objects: MemoryObjects) -> Self {
        Self { objects }
    }
}

impl SinkFactory for MemorySinkFactory {
    fn descriptor(&self) -> DataSinkType {
        descriptor_named("memory")
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn build(&self, instance: &DataSinkInstance) -> Result<Box<dyn SinkConnector>, ConnectorError> {
        let SinkMetadata::Memory(_) = &instance.connector else {
            return Err(wrong_metadata("memory", &instance.connector));
        };
        Ok(Box::new(MemorySink::new(self.objects.clone())))
    }
}
