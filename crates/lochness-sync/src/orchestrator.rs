// crates/lochness-sync/src/orchestrator.rs
// ============================================================================
// Module: Sync Orchestrator
// Description: Checkpointed, retryable transfer from one source to one sink.
// Purpose: Drive the fetch, write, and advance cycle for a source instance.
// Dependencies: lochness-connectors, lochness-core, lochness-vault, tokio-util, tracing
// ============================================================================

//! ## Overview
//! One call to [`Orchestrator::run_once`] is one [`SyncRun`]. The run walks
//! `Idle -> Fetching -> Writing -> Advancing` for every item the source
//! produces after the stored checkpoint:
//!
//! - every item is recorded in the in-flight ledger as fetched, written to
//!   the sink under its deterministic key, then marked written;
//! - the checkpoint advances to the contiguous written prefix every
//!   `checkpoint_interval` items, when the ledger fills, and at end of stream;
//! - transient and auth failures retry with backoff, cursor expiry reopens
//!   the stream from the checkpoint, anything else fails the run.
//!
//! Credentials are acquired from the vault immediately before each connector
//! call and dropped right after it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use lochness_config::SyncConfig;
use lochness_connectors::ConnectorRegistry;
use lochness_connectors::RegistryError;
use lochness_core::CatalogError;
use lochness_core::CatalogStore;
use lochness_core::ChangeItem;
use lochness_core::ChangeStream;
use lochness_core::CheckpointError;
use lochness_core::CheckpointStore;
use lochness_core::ConnectorError;
use lochness_core::DataSinkInstance;
use lochness_core::DataSourceInstance;
use lochness_core::ExternalId;
use lochness_core::InFlightLedger;
use lochness_core::KeyError;
use lochness_core::LedgerEntry;
use lochness_core::LedgerState;
use lochness_core::ObjectContext;
use lochness_core::ObjectKey;
use lochness_core::RunCounters;
use lochness_core::RunErrorDetail;
use lochness_core::RunOutcome;
use lochness_core::SinkConnector;
use lochness_core::SourceConnector;
use lochness_core::SourceInstanceId;
use lochness_core::StoreError;
use lochness_core::SyncRun;
use lochness_core::SyncRunId;
use lochness_core::SyncRunStore;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use lochness_vault::Vault;
use lochness_vault::VaultError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::info_span;
use tracing::warn;

use crate::events::SyncEvent;
use crate::events::SyncEventSink;
use crate::retry::RetryPolicy;
use crate::retry::sleep_unless_cancelled;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Run-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Catalog lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Connector type could not be resolved or built.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Credential could not be acquired.
    #[error(transparent)]
    Vault(#[from] VaultError),
    /// Connector call failed for good.
    #[error("{error} (attempts: {attempts})")]
    Connector {
        /// Final connector error.
        error: ConnectorError,
        /// Item being processed, when known.
        external_id: Option<ExternalId>,
        /// Attempts spent on the operation.
        attempts: u32,
    },
    /// Checkpoint store rejected an operation.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// Run history store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Item could not be mapped to a sink key.
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl SyncError {
    /// Returns the stable kind label recorded in run history.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Catalog(_) => "catalog",
            Self::Registry(_) => "registry",
            Self::Vault(_) => "vault",
            Self::Connector {
                error, ..
            } => error.kind(),
            Self::Checkpoint(CheckpointError::Regression {
                ..
            }) => "checkpoint_regression",
            Self::Checkpoint(_) => "checkpoint",
            Self::Store(_) => "store",
            Self::Key(_) => "invalid_key",
        }
    }

    /// Returns true when the failure means a store invariant was broken.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Checkpoint(CheckpointError::Regression { .. }))
    }

    /// Builds the structured detail persisted with a failed run.
    #[must_use]
    pub fn detail(&self) -> RunErrorDetail {
        match self {
            Self::Connector {
                error,
                external_id,
                attempts,
            } => RunErrorDetail {
                kind: error.kind().to_string(),
                message: error.to_string(),
                external_id: external_id.clone(),
                attempts: *attempts,
            },
            other => RunErrorDetail {
                kind: other.kind().to_string(),
                message: other.to_string(),
                external_id: None,
                attempts: 1,
            },
        }
    }
}

/// Why a run stopped before draining its stream.
enum Halt {
    /// Cancellation was observed between items or during a backoff.
    Cancelled,
    /// The run failed.
    Failed(SyncError),
}

impl From<SyncError> for Halt {
    fn from(error: SyncError) -> Self {
        Self::Failed(error)
    }
}

impl From<CatalogError> for Halt {
    fn from(error: CatalogError) -> Self {
        Self::Failed(error.into())
    }
}

impl From<RegistryError> for Halt {
    fn from(error: RegistryError) -> Self {
        Self::Failed(error.into())
    }
}

impl From<VaultError> for Halt {
    fn from(error: VaultError) -> Self {
        Self::Failed(error.into())
    }
}

impl From<CheckpointError> for Halt {
    fn from(error: CheckpointError) -> Self {
        Self::Failed(error.into())
    }
}

impl From<KeyError> for Halt {
    fn from(error: KeyError) -> Self {
        Self::Failed(error.into())
    }
}

// ============================================================================
// SECTION: Settings
// ============================================================================

/// Orchestrator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Backoff for retryable connector failures.
    pub retry: RetryPolicy,
    /// Written items between checkpoint advances.
    pub checkpoint_interval: usize,
    /// Ledger size that forces a checkpoint advance.
    pub max_in_flight: usize,
    /// Stream reopenings allowed after cursor expiry.
    pub max_cursor_restarts: u32,
}

impl SyncSettings {
    /// Builds settings from configuration.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            checkpoint_interval: usize::try_from(config.checkpoint_interval).unwrap_or(usize::MAX),
            max_in_flight: usize::try_from(config.max_in_flight).unwrap_or(usize::MAX),
            max_cursor_restarts: config.max_cursor_restarts,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct SyncServices {
    /// Catalog of instances.
    pub catalog: Arc<dyn CatalogStore>,
    /// Checkpoints and ledgers.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Run history.
    pub runs: Arc<dyn SyncRunStore>,
    /// Unlocked credential vault.
    pub vault: Arc<Vault>,
    /// Connector factories.
    pub registry: Arc<ConnectorRegistry>,
    /// Event receiver.
    pub events: Arc<dyn SyncEventSink>,
}

// ============================================================================
// SECTION: Run State
// ============================================================================

/// Mutable state of one run.
struct RunProgress {
    /// Run identifier.
    run_id: SyncRunId,
    /// Instance being synchronized.
    instance: SourceInstanceId,
    /// Item counters.
    counters: RunCounters,
    /// Last confirmed checkpoint.
    checkpoint: Watermark,
    /// Items fetched but not yet covered by the checkpoint.
    ledger: InFlightLedger,
    /// Items written since the last advance.
    since_advance: usize,
}

/// Resolved endpoints of one run.
struct Route<'a> {
    /// Source catalog entry.
    source_instance: &'a DataSourceInstance,
    /// Sink catalog entry.
    sink_instance: &'a DataSinkInstance,
    /// Source connector.
    source: &'a dyn SourceConnector,
    /// Sink connector.
    sink: &'a dyn SinkConnector,
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Drives sync runs for catalog instances.
pub struct Orchestrator {
    /// Shared collaborators.
    services: SyncServices,
    /// Tuning.
    settings: SyncSettings,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(services: SyncServices, settings: SyncSettings) -> Self {
        Self {
            services,
            settings,
        }
    }

    /// Returns the catalog used to resolve instances.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.services.catalog
    }

    /// Marks runs left in progress by a previous process as abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] when the run history cannot be updated.
    pub fn recover(&self) -> Result<Vec<SyncRunId>, SyncError> {
        let abandoned = self.services.runs.abandon_in_progress(Timestamp::now())?;
        for run_id in &abandoned {
            warn!(%run_id, "in-progress run from a previous process marked abandoned");
        }
        Ok(abandoned)
    }

    /// Executes one run for `instance` and returns its completed record.
    ///
    /// Failed runs are returned as `Ok` with [`RunOutcome::Failed`]; the
    /// history row carries the error detail.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] when the run cannot be recorded, including
    /// when another run of the same instance is in progress.
    pub async fn run_once(
        &self,
        instance: &SourceInstanceId,
        cancel: &CancellationToken,
    ) -> Result<SyncRun, SyncError> {
        let run = SyncRun::start(instance.clone(), Timestamp::now());
        self.services.runs.begin(&run)?;
        self.services.events.emit(&SyncEvent::RunStarted {
            run_id: run.id.clone(),
            instance: instance.clone(),
        });
        let mut progress = RunProgress {
            run_id: run.id.clone(),
            instance: instance.clone(),
            counters: RunCounters::default(),
            checkpoint: Watermark::origin(),
            ledger: InFlightLedger::new(),
            since_advance: 0,
        };
        let span = info_span!("sync_run", run_id = %run.id, instance = %instance);
        let result = self.execute(&mut progress, cancel).instrument(span).await;

        let (outcome, failure) = match result {
            Ok(()) => (RunOutcome::Succeeded, None),
            Err(Halt::Cancelled) => (RunOutcome::Partial, None),
            Err(Halt::Failed(error)) => (RunOutcome::Failed, Some(error)),
        };
        let mut finished =
            run.finish(outcome, Timestamp::now(), failure.as_ref().map(SyncError::detail));
        finished.counters = progress.counters;
        finished.watermark =
            (!progress.checkpoint.is_origin()).then(|| progress.checkpoint.clone());
        self.record_finish(&finished)?;

        match failure {
            Some(failure) => {
                let invariant_violation = failure.is_invariant_violation();
                if invariant_violation {
                    error!(
                        run_id = %finished.id,
                        %instance,
                        invariant_violation = true,
                        error = %failure,
                        "checkpoint regression rejected"
                    );
                }
                self.services.events.emit(&SyncEvent::RunFailed {
                    run_id: finished.id.clone(),
                    instance: instance.clone(),
                    error: failure.detail(),
                    counters: finished.counters,
                    invariant_violation,
                });
            }
            None => self.services.events.emit(&SyncEvent::RunFinished {
                run_id: finished.id.clone(),
                instance: instance.clone(),
                outcome,
                counters: finished.counters,
                watermark: finished.watermark.clone(),
            }),
        }
        Ok(finished)
    }

    /// Writes the completed run row, retrying once.
    ///
    /// A row that cannot be completed stays in progress and blocks further
    /// runs of the instance until [`Orchestrator::recover`] abandons it.
    fn record_finish(&self, finished: &SyncRun) -> Result<(), SyncError> {
        let Err(first) = self.services.runs.finish(finished) else {
            return Ok(());
        };
        warn!(
            run_id = %finished.id,
            instance = %finished.instance,
            error = %first,
            "run history update failed; retrying"
        );
        self.services.runs.finish(finished).map_err(|err| {
            error!(
                run_id = %finished.id,
                instance = %finished.instance,
                error = %err,
                "run history not updated; run left in progress until recovery"
            );
            SyncError::Store(err)
        })
    }

    /// Resolves the run's endpoints and drains the change stream.
    async fn execute(
        &self,
        progress: &mut RunProgress,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let source_instance = self.services.catalog.source_instance(&progress.instance)?;
        let sink_instance = self.services.catalog.sink_for(&source_instance)?;
        let source = self.services.registry.source_for(&source_instance)?;
        let sink = self.services.registry.sink_for(&sink_instance)?;
        progress.checkpoint = match self.services.checkpoints.get(&progress.instance) {
            Ok(watermark) => watermark,
            Err(CheckpointError::NotFound(_)) => Watermark::origin(),
            Err(err) => return Err(err.into()),
        };
        self.discard_stale_ledger(&progress.instance)?;
        let route = Route {
            source_instance: &source_instance,
            sink_instance: &sink_instance,
            source: source.as_ref(),
            sink: sink.as_ref(),
        };

        let mut restarts = 0;
        loop {
            let result = self.drain(&route, progress, cancel).await;
            match result {
                Err(Halt::Failed(SyncError::Connector {
                    error: ConnectorError::CursorExpired(reason),
                    ..
                })) if restarts < self.settings.max_cursor_restarts => {
                    restarts += 1;
                    self.advance(progress)?;
                    progress.ledger = InFlightLedger::new();
                    self.services.checkpoints.clear_in_flight(&progress.instance, None)?;
                    debug!(%reason, restart = restarts, "cursor expired");
                    self.services.events.emit(&SyncEvent::StreamRestarted {
                        run_id: progress.run_id.clone(),
                        instance: progress.instance.clone(),
                        restart: restarts,
                    });
                }
                Err(Halt::Cancelled) => {
                    self.advance(progress)?;
                    return Err(Halt::Cancelled);
                }
                other => return other,
            }
        }
    }

    /// Streams every item after the checkpoint into the sink.
    async fn drain(
        &self,
        route: &Route<'_>,
        progress: &mut RunProgress,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let since = progress.checkpoint.clone();
        let mut stream = self.open_stream(route, &since, progress, cancel).await?;
        let mut previous: Option<Watermark> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            let Some(item) = self.next_item(route, stream.as_mut(), progress, cancel).await? else {
                break;
            };
            let mark = item.watermark();
            let floor = previous.as_ref().unwrap_or(&since);
            if mark <= *floor {
                return Err(Halt::Failed(SyncError::Connector {
                    error: ConnectorError::Malformed(format!(
                        "item {} at {mark} is not after {floor}",
                        item.external_id
                    )),
                    external_id: Some(item.external_id.clone()),
                    attempts: 1,
                }));
            }
            previous = Some(mark.clone());
            self.deliver(route, &item, mark, progress, cancel).await?;
        }
        self.advance(progress)?;
        Ok(())
    }

    /// Opens the change stream, retrying retryable failures.
    async fn open_stream(
        &self,
        route: &Route<'_>,
        since: &Watermark,
        progress: &RunProgress,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ChangeStream>, Halt> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let credential = self.services.vault.acquire(&route.source_instance.credential_ref)?;
            let result = route.source.list_changes(since, &credential).await;
            drop(credential);
            match result {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    self.back_off("list_changes", err, attempt, None, progress, cancel).await?;
                }
            }
        }
    }

    /// Pulls the next item, retrying retryable failures.
    async fn next_item(
        &self,
        route: &Route<'_>,
        stream: &mut dyn ChangeStream,
        progress: &RunProgress,
        cancel: &CancellationToken,
    ) -> Result<Option<ChangeItem>, Halt> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let credential = self.services.vault.acquire(&route.source_instance.credential_ref)?;
            let result = stream.next_item(&credential).await;
            drop(credential);
            match result {
                Ok(item) => return Ok(item),
                Err(err) => {
                    self.back_off("next_item", err, attempt, None, progress, cancel).await?;
                }
            }
        }
    }

    /// Records, writes, and confirms one item.
    async fn deliver(
        &self,
        route: &Route<'_>,
        item: &ChangeItem,
        mark: Watermark,
        progress: &mut RunProgress,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let key = ObjectKey::for_item(
            route.sink_instance.connector.prefix(),
            &route.source_instance.id,
            &item.external_id,
        )?;
        if !progress.ledger.push_fetched(mark.clone(), key.clone()) {
            return Err(Halt::Failed(SyncError::Connector {
                error: ConnectorError::Malformed(format!("ledger already holds {mark}")),
                external_id: Some(item.external_id.clone()),
                attempts: 1,
            }));
        }
        self.services.checkpoints.record_in_flight(
            &progress.instance,
            &LedgerEntry {
                watermark: mark.clone(),
                key: key.clone(),
                state: LedgerState::Fetched,
            },
        )?;
        progress.counters.fetched += 1;

        let context = ObjectContext {
            project: route.source_instance.project.clone(),
            site: route.source_instance.site.clone(),
            source_instance: route.source_instance.id.clone(),
            subject: item.subject_id.clone(),
        };
        let mut attempt = 0;
        let ack = loop {
            attempt += 1;
            let credential = self.services.vault.acquire(&route.sink_instance.credential_ref)?;
            let result = route.sink.put(&key, &item.payload, &context, &credential).await;
            drop(credential);
            match result {
                Ok(ack) => break ack,
                Err(err) => {
                    self.back_off("put", err, attempt, Some(&item.external_id), progress, cancel)
                        .await?;
                }
            }
        };
        if ack.written {
            progress.counters.written += 1;
        } else {
            progress.counters.unchanged += 1;
        }
        debug!(key = %key, written = ack.written, attempts = attempt, "item delivered");

        progress.ledger.mark_written(&mark);
        self.services.checkpoints.record_in_flight(
            &progress.instance,
            &LedgerEntry {
                watermark: mark,
                key,
                state: LedgerState::Written,
            },
        )?;
        progress.since_advance += 1;
        if progress.since_advance >= self.settings.checkpoint_interval
            || progress.ledger.len() >= self.settings.max_in_flight
        {
            self.advance(progress)?;
        }
        Ok(())
    }

    /// Waits before the next attempt, or turns the error into a failure.
    async fn back_off(
        &self,
        operation: &'static str,
        error: ConnectorError,
        attempt: u32,
        external_id: Option<&ExternalId>,
        progress: &RunProgress,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        if !error.is_retryable() || !self.settings.retry.allows_retry(attempt) {
            return Err(Halt::Failed(SyncError::Connector {
                error,
                external_id: external_id.cloned(),
                attempts: attempt,
            }));
        }
        let delay = self.settings.retry.delay(attempt);
        self.services.events.emit(&SyncEvent::RetryScheduled {
            run_id: progress.run_id.clone(),
            instance: progress.instance.clone(),
            operation,
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error_kind: error.kind(),
            external_id: external_id.cloned(),
        });
        if sleep_unless_cancelled(delay, cancel).await {
            Ok(())
        } else {
            Err(Halt::Cancelled)
        }
    }

    /// Advances the checkpoint through the contiguous written prefix.
    fn advance(&self, progress: &mut RunProgress) -> Result<(), SyncError> {
        progress.since_advance = 0;
        let Some(mark) = progress.ledger.advanceable() else {
            return Ok(());
        };
        self.services.checkpoints.advance(&progress.instance, &mark)?;
        progress.ledger.drain_through(&mark);
        progress.checkpoint = mark.clone();
        self.services.events.emit(&SyncEvent::CheckpointAdvanced {
            run_id: progress.run_id.clone(),
            instance: progress.instance.clone(),
            watermark: mark,
        });
        Ok(())
    }

    /// Drops ledger entries left behind by an interrupted run.
    fn discard_stale_ledger(&self, instance: &SourceInstanceId) -> Result<(), CheckpointError> {
        let stale = self.services.checkpoints.in_flight(instance)?;
        if !stale.is_empty() {
            warn!(count = stale.len(), "discarding ledger entries from an interrupted run");
            self.services.checkpoints.clear_in_flight(instance, None)?;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, clippy::unwrap_used, reason = "Test-only assertions.")]

    use super::*;

    #[test]
    fn regression_is_an_invariant_violation() {
        let error = SyncError::Checkpoint(CheckpointError::Regression {
            instance: SourceInstanceId::new("redcap-1"),
            stored: Watermark::at(Timestamp::from_unix_millis(2), ExternalId::new("b")),
            proposed: Watermark::at(Timestamp::from_unix_millis(1), ExternalId::new("a")),
        });
        assert!(error.is_invariant_violation());
        assert_eq!(error.kind(), "checkpoint_regression");
        assert_eq!(error.detail().attempts, 1);
    }

    #[test]
    fn connector_detail_keeps_item_and_attempts() {
        let error = SyncError::Connector {
            error: ConnectorError::Transient("HTTP 503".to_string()),
            external_id: Some(ExternalId::new("2")),
            attempts: 5,
        };
        let detail = error.detail();
        assert_eq!(detail.kind, "transient");
        assert_eq!(detail.external_id, Some(ExternalId::new("2")));
        assert_eq!(detail.attempts, 5);
        assert!(!error.is_invariant_violation());
    }

    #[test]
    fn settings_follow_configuration() {
        let config = SyncConfig {
            checkpoint_interval: 7,
            max_in_flight: 9,
            ..SyncConfig::default()
        };
        let settings = SyncSettings::from_config(&config);
        assert_eq!(settings.checkpoint_interval, 7);
        assert_eq!(settings.max_in_flight, 9);
        assert_eq!(settings.retry.max_attempts, config.max_attempts);
    }
}
