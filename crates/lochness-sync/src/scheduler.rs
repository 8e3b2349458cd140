// crates/lochness-sync/src/scheduler.rs
// ============================================================================
// Module: Scheduler
// Description: Bounded concurrent execution of sync runs.
// Purpose: Trigger runs per instance with at most one active run each.
// Dependencies: tokio, tokio-util, tracing
// ============================================================================

//! ## Overview
//! The scheduler owns a worker pool bounded by a semaphore. A triggered run
//! is active from the moment it is queued until its task completes, and a
//! second trigger for the same instance returns
//! [`SchedulerError::AlreadyRunning`]. Every run gets a child of the
//! scheduler's shutdown token, so [`Scheduler::shutdown`] cancels queued and
//! running work alike and then waits for it to drain.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use lochness_core::CatalogError;
use lochness_core::SourceInstanceId;
use lochness_core::SyncRun;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::orchestrator::Orchestrator;
use crate::orchestrator::SyncError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Scheduler failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// A run for the instance is queued or executing.
    #[error("sync run already active for {0}")]
    AlreadyRunning(SourceInstanceId),
    /// The scheduler no longer accepts work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
    /// The run was cancelled before it acquired a worker.
    #[error("queued sync run cancelled for {0}")]
    Cancelled(SourceInstanceId),
    /// Active instances could not be listed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// The run could not be recorded.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ============================================================================
// SECTION: Scheduler
// ============================================================================

/// Active runs keyed by instance.
type ActiveRuns = Arc<Mutex<BTreeMap<SourceInstanceId, CancellationToken>>>;

/// Bounded pool of sync runs.
pub struct Scheduler {
    /// Run executor.
    orchestrator: Arc<Orchestrator>,
    /// Worker permits.
    permits: Arc<Semaphore>,
    /// Queued and executing runs.
    active: ActiveRuns,
    /// Parent of every run token.
    shutdown: CancellationToken,
    /// Spawned run tasks.
    tasks: TaskTracker,
}

impl Scheduler {
    /// Creates a scheduler running at most `workers` runs at once.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, workers: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            active: Arc::new(Mutex::new(BTreeMap::new())),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Queues a run for `instance`.
    ///
    /// The returned handle resolves to the completed run record.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] when a run for the instance
    /// is active and [`SchedulerError::ShuttingDown`] after shutdown began.
    pub fn trigger(
        &self,
        instance: &SourceInstanceId,
    ) -> Result<JoinHandle<Result<SyncRun, SchedulerError>>, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(instance) {
            return Err(SchedulerError::AlreadyRunning(instance.clone()));
        }
        let cancel = self.shutdown.child_token();
        active.insert(instance.clone(), cancel.clone());
        drop(active);
        debug!(%instance, "sync run queued");

        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        let instance = instance.clone();
        Ok(self.tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let result = match permit {
                Some(permit) => {
                    let result = orchestrator.run_once(&instance, &cancel).await;
                    drop(permit);
                    result.map_err(SchedulerError::from)
                }
                None => Err(SchedulerError::Cancelled(instance.clone())),
            };
            active.lock().unwrap_or_else(PoisonError::into_inner).remove(&instance);
            if let Err(err) = &result {
                warn!(%instance, error = %err, "sync run did not complete");
            }
            result
        }))
    }

    /// Cancels the active run for `instance`, if any.
    ///
    /// Returns true when a run was signalled.
    pub fn cancel(&self, instance: &SourceInstanceId) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let token = active.get(instance).cloned();
        drop(active);
        let Some(token) = token else {
            return false;
        };
        token.cancel();
        info!(%instance, "sync run cancellation requested");
        true
    }

    /// Returns true while a run for `instance` is queued or executing.
    #[must_use]
    pub fn is_active(&self, instance: &SourceInstanceId) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).contains_key(instance)
    }

    /// Returns the number of queued and executing runs.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Triggers a run for every active catalog instance without one running.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Catalog`] when instances cannot be listed and
    /// [`SchedulerError::ShuttingDown`] after shutdown began.
    pub fn trigger_all(&self) -> Result<Vec<SourceInstanceId>, SchedulerError> {
        let instances = self.orchestrator.catalog().list_source_instances(true)?;
        let mut triggered = Vec::new();
        for instance in instances {
            match self.trigger(&instance.id) {
                Ok(_) => triggered.push(instance.id),
                Err(SchedulerError::AlreadyRunning(id)) => {
                    debug!(instance = %id, "skipping instance with an active run");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(triggered)
    }

    /// Triggers every active instance each `interval` until `stop` fires,
    /// then shuts down.
    pub async fn run(&self, interval: Duration, stop: &CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.trigger_all() {
                Ok(triggered) => debug!(count = triggered.len(), "scheduler tick"),
                Err(SchedulerError::ShuttingDown) => break,
                Err(err) => warn!(error = %err, "scheduler tick failed"),
            }
        }
        self.shutdown().await;
    }

    /// Stops accepting work, cancels every run, and waits for them to end.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        let pending = self.tasks.len();
        if pending > 0 {
            info!(pending, "waiting for sync runs to stop");
        }
        self.tasks.wait().await;
        info!("scheduler stopped");
    }
}
