//! Lifecycle guarantees that must hold across any sequence of events.
//!
//! # What is tested
//!
//! - A source never holds two open contexts at once
//! - A context is never closed while a lease is using it
//! - Lease notifications alternate and end with `Disposed`
//! - Without user activation no resume is ever issued outside a gesture,
//!   including after a device wake

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use audiokeep_core::{
    BackgroundState, ContextError, ContextLease, SessionConfig, SimulatedPlatform,
    platform::sim::PlatformCall,
};
use common::{assert_alternates, drain_changes, gesture_when_awaited, spawn_source, until};

const READY: Duration = Duration::from_secs(30);

// ── Helpers ────────────────────────────────────────────────────────

/// Replay the journal and return the largest number of contexts that were
/// open at the same time.
fn max_open_contexts(journal: &[PlatformCall]) -> usize {
    let mut open = BTreeSet::new();
    let mut max = 0;
    for call in journal {
        match call {
            PlatformCall::Create { context } => {
                open.insert(*context);
                max = max.max(open.len());
            }
            PlatformCall::Close { context } => {
                open.remove(context);
            }
            _ => {}
        }
    }
    max
}

/// Use the context over and over until the lease is disposed.
fn keep_busy(lease: Arc<ContextLease>, work: Duration) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut uses = 0;
        loop {
            match lease.use_context(|_| tokio::time::sleep(work)).await {
                Ok(()) => uses += 1,
                Err(ContextError::Disposed) => return uses,
                Err(e) => panic!("unexpected use failure: {e}"),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

fn resumes_without_gesture(journal: &[PlatformCall]) -> usize {
    journal
        .iter()
        .filter(|call| matches!(call, PlatformCall::Resume { gesture: false, .. }))
        .count()
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn never_more_than_one_open_context() {
    let platform = SimulatedPlatform::always_interactive();
    platform.fail_module_load("feeder", 1);
    let config = SessionConfig::default();
    let (source, _gate) = spawn_source(&platform, &config);
    let lease = source.acquire("player").unwrap();

    source.when_ready_within(READY).await.unwrap();
    assert_eq!(platform.created_count(), 2, "failed module load discards");

    source.reset().await.unwrap();
    source.when_ready_within(READY).await.unwrap();

    // A broken context stays broken until it is recreated.
    source.break_context();
    lease
        .use_context(|_| tokio::time::sleep(Duration::from_secs(3)))
        .await
        .unwrap();
    until("the broken context to be replaced", || platform.created_count() == 4).await;
    source.when_ready_within(READY).await.unwrap();

    source.on_device_wake();
    until("a context after the wake", || platform.created_count() == 5).await;
    source.when_ready_within(READY).await.unwrap();

    source.update_background_state(BackgroundState::BackgroundIdle);
    until("the idle context to close", || platform.live_context_count() == 0).await;
    source.update_background_state(BackgroundState::Foreground);
    source.when_ready_within(READY).await.unwrap();

    source.dispose().await;
    let journal = platform.journal();
    assert_eq!(max_open_contexts(&journal), 1, "{journal:?}");
    assert_eq!(platform.live_context_count(), 0);
    assert_eq!(platform.created_count(), platform.closed_count());
}

#[tokio::test(start_paused = true)]
async fn never_closes_a_context_in_use() {
    let platform = SimulatedPlatform::always_interactive();
    let config = SessionConfig::default();
    let (source, _gate) = spawn_source(&platform, &config);

    let violations = Arc::new(AtomicUsize::new(0));
    platform.on_close({
        let source = source.clone();
        let violations = Arc::clone(&violations);
        move |_| {
            if source.has_leases_in_use() {
                violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let workers: Vec<_> = [300, 700, 1100]
        .into_iter()
        .enumerate()
        .map(|(n, millis)| {
            let lease = Arc::new(source.acquire(format!("worker-{n}")).unwrap());
            keep_busy(lease, Duration::from_millis(millis))
        })
        .collect();

    source.when_ready_within(READY).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    source.reset().await.unwrap();
    source.when_ready_within(READY).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    source.break_context();
    until("the broken context to close", || platform.closed_count() == 2).await;
    source.when_ready_within(READY).await.unwrap();

    source.on_device_wake();
    until("the context to close after the wake", || platform.closed_count() == 3).await;
    source.when_ready_within(READY).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    source.dispose().await;
    for worker in workers {
        assert!(worker.await.unwrap() > 0);
    }
    assert_eq!(platform.closed_count(), 4);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn changes_alternate_and_end_with_disposed() {
    let platform = SimulatedPlatform::always_interactive();
    let config = SessionConfig::default();
    let (source, _gate) = spawn_source(&platform, &config);
    let mut early = source.acquire("early").unwrap();

    source.when_ready_within(READY).await.unwrap();
    let mut late = source.acquire("late").unwrap();

    source.reset().await.unwrap();
    source.when_ready_within(READY).await.unwrap();

    source.update_background_state(BackgroundState::BackgroundIdle);
    until("the idle suspension", || source.current().is_none()).await;
    source.update_background_state(BackgroundState::Foreground);
    source.when_ready_within(READY).await.unwrap();

    source.on_device_wake();
    until("a context after the wake", || platform.created_count() == 3).await;
    source.when_ready_within(READY).await.unwrap();

    late.dispose().await;
    source.dispose().await;

    for lease in [&mut early, &mut late] {
        let changes = drain_changes(lease);
        assert_alternates(&changes);
        assert_eq!(changes.last(), Some(&audiokeep_core::ContextChange::Disposed));
        assert!(lease.next_change().await.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn resumes_only_inside_gestures_without_activation() {
    let platform = SimulatedPlatform::new();
    let config = SessionConfig::default();
    let (source, gate) = spawn_source(&platform, &config);
    let _lease = source.acquire("player").unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(platform.resume_count(), 0);
    assert!(source.current().is_none());

    gesture_when_awaited(&gate).await;
    source.when_ready_within(READY).await.unwrap();
    assert_eq!(resumes_without_gesture(&platform.journal()), 0);

    platform.simulate_sleep();
    gate.on_device_wake();
    source.on_device_wake();
    let mark = platform.journal().len();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(
        platform.journal()[mark..]
            .iter()
            .all(|call| !matches!(call, PlatformCall::Resume { .. })),
        "resumed before a fresh gesture"
    );
    assert!(source.status().awaiting_gesture);

    gesture_when_awaited(&gate).await;
    source.when_ready_within(READY).await.unwrap();
    assert_eq!(resumes_without_gesture(&platform.journal()), 0);
    source.dispose().await;
}
