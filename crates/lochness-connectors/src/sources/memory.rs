// crates/lochness-connectors/src/sources/memory.rs
// ============================================================================
// Module: In-Memory Source
// Description: Process-local change feeds.
// Purpose: Drive dry runs and tests without a vendor endpoint.
// Dependencies: lochness-core
// ============================================================================

//! ## Overview
//! A [`MemoryFeed`] is a shared list of change items. Sources read a snapshot
//! of their feed at `list_changes` time, so items pushed afterwards appear
//! only in the next run.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use lochness_core::ChangeItem;
use lochness_core::ChangeStream;
use lochness_core::ConnectorError;
use lochness_core::DataSourceInstance;
use lochness_core::DataSourceType;
use lochness_core::Secret;
use lochness_core::SourceConnector;
use lochness_core::SourceMetadata;
use lochness_core::Watermark;

use crate::registry::SourceFactory;
use crate::sources::descriptor_named;
use crate::sources::order_after;
use crate::sources::wrong_metadata;

// ============================================================================
// SECTION: Feeds
// ============================================================================

/// Shared, append-only list of change items.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    /// Items in push order.
    items: Arc<Mutex<Vec<ChangeItem>>>,
}

impl MemoryFeed {
    /// Appends an item.
    pub fn push(&self, item: ChangeItem) {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).push(item);
    }

    /// Returns a copy of every item.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChangeItem> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Named feeds shared between the registry and the code producing items.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeeds {
    /// Feeds by name.
    feeds: Arc<Mutex<BTreeMap<String, MemoryFeed>>>,
}

impl MemoryFeeds {
    /// Returns the feed called `name`, creating it when absent.
    #[must_use]
    pub fn feed(&self, name: &str) -> MemoryFeed {
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

// ============================================================================
// SECTION: Source
// ============================================================================

/// Source reading one memory feed.
pub struct MemorySource {
    /// Feed backing this source.
    feed: MemoryFeed,
}

impl MemorySource {
    /// Creates a source over `feed`.
    #[must_use]
    pub const fn new(feed: MemoryFeed) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    async fn list_changes(
        &self,
        since: &Watermark,
        _credential: &Secret,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError> {
        let entries = self
            .feed
            .snapshot()
            .into_iter()
            .map(|item| (item.produced_at, item.external_id.clone(), item))
            .collect();
        let pending = order_after(since, entries).into_iter().map(|(_, _, item)| item).collect();
        Ok(Box::new(MemoryStream { pending }))
    }
}

/// Stream over a feed snapshot.
struct MemoryStream {
    /// Items not yet produced.
    pending: VecDeque<ChangeItem>,
}

#[async_trait]
impl ChangeStream for MemoryStream {
    async fn next_item(
        &mut self,
        _credential: &Secret,
    ) -> Result<Option<ChangeItem>, ConnectorError> {
        Ok(self.pending.pop_front())
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Factory for `memory` sources.
pub struct MemorySourceFactory {
    /// Shared feeds.
    feeds: MemoryFeeds,
}

impl MemorySourceFactory {
    /// Creates a factory over `feeds`.
    #[must_use]
    pub const fn new(feeds: MemoryFeeds) -> Self {
        Self { feeds }
    }
}

impl SourceFactory for MemorySourceFactory {
    fn descriptor(&self) -> DataSourceType {
        descriptor_named("memory")
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn build(
        &self,
        instance: &DataSourceInstance,
    ) -> Result<Box<dyn SourceConnector>, ConnectorError> {
        let SourceMetadata::Memory(meta) = &instance.connector else {
            return Err(wrong_metadata("memory", &instance.connector));
        };
        let name = meta.feed.as_deref().unwrap_or(instance.id.as_str());
        Ok(Box::new(MemorySource::new(self.feeds.feed(name))))
    }
}
