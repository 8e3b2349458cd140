// crates/lochness-sync/tests/scheduler.rs
// ============================================================================
// Module: Scheduler Tests
// Description: Per-instance exclusivity, worker bounds, fan-out, and shutdown.
// Purpose: Pin trigger and drain semantics of the worker pool.
// Dependencies: lochness-sync, lochness-core, tokio
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use lochness_core::RunOutcome;
use lochness_sync::Scheduler;
use lochness_sync::SchedulerError;
use tokio_util::sync::CancellationToken;

use crate::common::Harness;
use crate::common::SinkHook;
use crate::common::fast_settings;
use crate::common::item;
use crate::common::mark;
use crate::common::source_id;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Writes currently inside the sink and the highest overlap seen.
#[derive(Default)]
struct InFlight {
    /// Writes in progress.
    current: AtomicUsize,
    /// Peak of `current`.
    peak: AtomicUsize,
}

/// Hook holding each write until `peers` writes overlap or `patience` passes.
fn overlapping_writes(in_flight: Arc<InFlight>, peers: usize, patience: Duration) -> SinkHook {
    Arc::new(move |_| {
        let now = in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        in_flight.peak.fetch_max(now, Ordering::SeqCst);
        let deadline = Instant::now() + patience;
        while in_flight.peak.load(Ordering::SeqCst) < peers && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        in_flight.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[tokio::test]
async fn a_second_trigger_while_queued_is_rejected() {
    let harness = Harness::in_memory();
    harness.push(&[item("1", 1_000)]);
    let orchestrator = Arc::new(harness.orchestrator(harness.builtin_registry(), fast_settings()));
    let scheduler = Scheduler::new(orchestrator, 2);

    let handle = scheduler.trigger(&source_id()).unwrap();
    assert!(scheduler.is_active(&source_id()));
    assert_eq!(
        scheduler.trigger(&source_id()).unwrap_err(),
        SchedulerError::AlreadyRunning(source_id())
    );

    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);
    assert!(!scheduler.is_active(&source_id()));
    assert_eq!(scheduler.active_count(), 0);

    let again = scheduler.trigger(&source_id()).unwrap().await.unwrap().unwrap();
    assert_eq!(again.counters.fetched, 0);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_single_worker_runs_one_instance_at_a_time() {
    let harness = Harness::in_memory();
    let second = harness.add_source("sim-2");
    harness.push(&[item("1", 1_000)]);
    harness.push_to("sim-2", &[item("2", 1_000)]);
    let in_flight = Arc::new(InFlight::default());
    let hook = overlapping_writes(Arc::clone(&in_flight), 2, Duration::from_millis(200));
    let orchestrator = Arc::new(harness.orchestrator(harness.registry_with_sink_hook(hook), fast_settings()));
    let scheduler = Scheduler::new(orchestrator, 1);

    let first_run = scheduler.trigger(&source_id()).unwrap();
    let second_run = scheduler.trigger(&second).unwrap();
    assert_eq!(first_run.await.unwrap().unwrap().outcome, RunOutcome::Succeeded);
    assert_eq!(second_run.await.unwrap().unwrap().outcome, RunOutcome::Succeeded);

    assert_eq!(in_flight.peak.load(Ordering::SeqCst), 1);
    assert_eq!(harness.object_keys().len(), 2);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_instances_run_in_parallel_up_to_the_worker_count() {
    let harness = Harness::in_memory();
    let second = harness.add_source("sim-2");
    harness.push(&[item("1", 1_000)]);
    harness.push_to("sim-2", &[item("2", 1_000)]);
    let in_flight = Arc::new(InFlight::default());
    let hook = overlapping_writes(Arc::clone(&in_flight), 2, Duration::from_secs(10));
    let orchestrator = Arc::new(harness.orchestrator(harness.registry_with_sink_hook(hook), fast_settings()));
    let scheduler = Scheduler::new(orchestrator, 2);

    let started = Instant::now();
    let first_run = scheduler.trigger(&source_id()).unwrap();
    let second_run = scheduler.trigger(&second).unwrap();
    assert_eq!(first_run.await.unwrap().unwrap().outcome, RunOutcome::Succeeded);
    assert_eq!(second_run.await.unwrap().unwrap().outcome, RunOutcome::Succeeded);

    assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() < Duration::from_secs(10), "writes met without waiting out the hook");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn trigger_all_runs_every_active_instance() {
    let harness = Harness::in_memory();
    harness.push(&[item("1", 1_000), item("2", 2_000)]);
    let orchestrator = Arc::new(harness.orchestrator(harness.builtin_registry(), fast_settings()));
    let scheduler = Scheduler::new(orchestrator, 1);

    let triggered = scheduler.trigger_all().unwrap();
    assert_eq!(triggered, vec![source_id()]);
    assert!(scheduler.trigger_all().unwrap().is_empty());

    scheduler.shutdown().await;
    assert!(!scheduler.is_active(&source_id()));
}

#[tokio::test]
async fn shutdown_cancels_queued_runs_and_rejects_new_ones() {
    let harness = Harness::in_memory();
    harness.push(&[item("1", 1_000)]);
    let orchestrator = Arc::new(harness.orchestrator(harness.builtin_registry(), fast_settings()));
    let scheduler = Scheduler::new(orchestrator, 1);

    let handle = scheduler.trigger(&source_id()).unwrap();
    scheduler.shutdown().await;
    assert_eq!(handle.await.unwrap().unwrap_err(), SchedulerError::Cancelled(source_id()));
    assert_eq!(scheduler.trigger(&source_id()).unwrap_err(), SchedulerError::ShuttingDown);
    assert!(harness.runs.list_runs(&source_id(), 10).unwrap().is_empty());
}

#[tokio::test]
async fn cancel_signals_only_active_instances() {
    let harness = Harness::in_memory();
    harness.push(&[item("1", 1_000)]);
    let orchestrator = Arc::new(harness.orchestrator(harness.builtin_registry(), fast_settings()));
    let scheduler = Scheduler::new(orchestrator, 1);

    assert!(!scheduler.cancel(&source_id()));
    let handle = scheduler.trigger(&source_id()).unwrap();
    assert!(scheduler.cancel(&source_id()));
    assert_eq!(handle.await.unwrap().unwrap_err(), SchedulerError::Cancelled(source_id()));
    assert!(!scheduler.is_active(&source_id()));
}

#[tokio::test(start_paused = true)]
async fn the_run_loop_ticks_until_stopped() {
    let harness = Harness::in_memory();
    harness.push(&[item("1", 1_000)]);
    let orchestrator = Arc::new(harness.orchestrator(harness.builtin_registry(), fast_settings()));
    let scheduler = Arc::new(Scheduler::new(orchestrator, 2));
    let stop = CancellationToken::new();

    let looping = {
        let scheduler = Arc::clone(&scheduler);
        let stop = stop.clone();
        tokio::spawn(async move { scheduler.run(Duration::from_secs(60), &stop).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    harness.push(&[item("2", 2_000)]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    stop.cancel();
    looping.await.unwrap();

    assert_eq!(harness.checkpoints.get(&source_id()).unwrap(), mark("2", 2_000));
    assert!(harness.runs.list_runs(&source_id(), 10).unwrap().len() >= 2);
    assert_eq!(scheduler.trigger(&source_id()).unwrap_err(), SchedulerError::ShuttingDown);
}
