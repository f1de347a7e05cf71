//! End-to-end scenarios for a context source on the simulated platform.
//!
//! # What is tested
//!
//! - A lease acquired before any context exists becomes ready after the
//!   first gesture, within one test cycle
//! - Background idling suspends a context in use but closes it only after
//!   every lease has finished
//! - Repeated repair failures escalate: the context is closed and not
//!   recreated until the next gesture
//! - A device wake revokes interaction and the next resume waits for a
//!   fresh gesture

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use audiokeep_core::{
    AudioSessionManager, BackgroundState, ContextChange, ContextPurpose, ContextState,
    ContextError, InteractionKind, MaintainState, SessionConfig, SimulatedPlatform,
    SourceEvent, SourceEventKind, platform::sim::PlatformCall,
};
use common::{drain_changes, gesture_when_awaited, spawn_source, until};
use tokio::sync::broadcast;
use tokio_test::{assert_pending, task};

// ── Helpers ────────────────────────────────────────────────────────

/// Record the interactive resume count of every escalation.
fn collect_escalations(mut events: broadcast::Receiver<SourceEvent>) -> Arc<Mutex<Vec<u32>>> {
    let escalations = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&escalations);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SourceEvent {
                    kind:
                        SourceEventKind::Escalated {
                            interactive_resume_count,
                            ..
                        },
                    ..
                }) => sink.lock().unwrap().push(interactive_resume_count),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    panic!("missed {missed} source events")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    escalations
}

// ── Readiness after the first gesture ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn lease_becomes_ready_after_first_gesture() {
    let platform = SimulatedPlatform::new();
    let config = SessionConfig::default();
    let (source, gate) = spawn_source(&platform, &config);
    let lease = source.acquire("player").unwrap();

    let mut ready = task::spawn(lease.when_ready());
    assert_pending!(ready.poll());

    // No gesture: the context is created but stays suspended.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_pending!(ready.poll());
    assert_eq!(platform.created_count(), 1);
    assert_eq!(platform.resume_count(), 0);
    assert!(source.status().awaiting_gesture);

    until("the source to wait for a gesture", || gate.waiter_count() > 0).await;
    gate.report_interaction(InteractionKind::Click);
    drop(ready);

    let handle = tokio::time::timeout(config.source.maintain_cycle(), lease.when_ready())
        .await
        .expect("ready within one test cycle")
        .unwrap();
    assert_eq!(handle.state(), ContextState::Running);
    assert_eq!(source.current(), Some(handle));
    assert!(gate.is_interactive());

    source.dispose().await;
}

// ── Idle in the background ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_background_suspends_then_closes_after_last_use() {
    let platform = SimulatedPlatform::always_interactive();
    let config = SessionConfig::default();
    let (source, _gate) = spawn_source(&platform, &config);
    let mut idle_lease = source.acquire("meter").unwrap();
    let busy_lease = source.acquire("recorder").unwrap();
    let handle = source
        .when_ready_within(Duration::from_secs(5))
        .await
        .unwrap();

    let busy = tokio::spawn(async move {
        let result = busy_lease
            .use_context(|_| tokio::time::sleep(Duration::from_secs(10)))
            .await;
        (busy_lease, result)
    });
    until("the recorder to use the context", || source.has_leases_in_use()).await;
    let use_started = tokio::time::Instant::now();

    source.update_background_state(BackgroundState::BackgroundIdle);
    tokio::time::sleep(config.source.suspend_debounce() + Duration::from_millis(200)).await;

    assert_eq!(handle.state(), ContextState::Suspended);
    assert_eq!(platform.closed_count(), 0);
    assert!(source.has_leases_in_use());
    assert!(source.current().is_none());

    let (busy_lease, result) = busy.await.unwrap();
    assert!(result.is_ok());
    assert!(!busy_lease.is_in_use());

    // Still within the close debounce after the last use ended.
    tokio::time::sleep_until(
        use_started + Duration::from_secs(10) + config.source.close_debounce()
            - Duration::from_secs(1),
    )
    .await;
    assert_eq!(platform.closed_count(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(platform.closed_count(), 1);
    assert_eq!(handle.state(), ContextState::Closed);

    // Nothing is recreated while idle in the background.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(platform.created_count(), 1);
    assert_eq!(source.state(), MaintainState::NoHandle);

    source.update_background_state(BackgroundState::Foreground);
    let next = source
        .when_ready_within(Duration::from_secs(5))
        .await
        .unwrap();
    assert_ne!(next, handle);

    let changes = drain_changes(&mut idle_lease);
    assert_eq!(
        changes,
        vec![
            ContextChange::NotReady,
            ContextChange::Ready(handle),
            ContextChange::NotReady,
            ContextChange::Ready(next),
        ]
    );
    source.dispose().await;
}

// ── Escalation ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn repeated_repair_failures_escalate_until_next_gesture() {
    let platform = SimulatedPlatform::new();
    let config = SessionConfig::default();
    let (source, gate) = spawn_source(&platform, &config);
    let escalations = collect_escalations(source.subscribe_events());
    let lease = source.acquire("player").unwrap();

    gesture_when_awaited(&gate).await;
    let broken = source
        .when_ready_within(Duration::from_secs(5))
        .await
        .unwrap();

    // The context keeps reporting running, but its clock stops.
    platform.freeze_clocks();
    lease
        .use_context(|_| tokio::time::sleep(Duration::from_secs(3)))
        .await
        .unwrap();

    for attempt in 1..=config.source.max_interactive_resume_count {
        gesture_when_awaited(&gate).await;
        assert_eq!(platform.closed_count(), 0, "closed before attempt {attempt}");
    }

    until("the broken context to close", || platform.closed_count() == 1).await;
    assert_eq!(broken.state(), ContextState::Closed);

    // Escalated: no new context until the user interacts again.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(platform.created_count(), 1);
    assert!(source.current().is_none());

    gate.report_interaction(InteractionKind::Click);
    let recreated = source
        .when_ready_within(Duration::from_secs(5))
        .await
        .unwrap();
    assert_ne!(recreated, broken);
    assert_eq!(platform.created_count(), 2);
    assert_eq!(source.status().interactive_resume_count, 0);

    assert_eq!(
        *escalations.lock().unwrap(),
        vec![config.source.max_interactive_resume_count]
    );
    source.dispose().await;
}

// ── Device wake ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn device_wake_requires_a_fresh_gesture() {
    common::init_logging();
    let platform = Arc::new(SimulatedPlatform::new());
    let mut config = SessionConfig::default();
    config.wake.enabled = false;
    let manager = AudioSessionManager::start(platform.clone(), &config);
    let gate = manager.gate().clone();

    // One gesture serves both sources once both wait on it.
    until("both sources to wait for a gesture", || gate.waiter_count() == 2).await;
    gate.report_interaction(InteractionKind::Click);
    let before = manager
        .playback()
        .when_ready_within(Duration::from_secs(5))
        .await
        .unwrap();
    manager
        .recording()
        .when_ready_within(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(gate.is_interactive());

    platform.simulate_sleep();
    manager.on_device_wake();
    assert!(!gate.is_interactive());

    until("both contexts to be recreated", || platform.created_count() == 4).await;
    until("both resumes to wait on the gate", || gate.waiter_count() == 2).await;
    let journal_before_gesture = platform.journal();
    assert_eq!(before.state(), ContextState::Closed);

    // The replacements were not resumed autonomously.
    let recreated: Vec<u64> = journal_before_gesture
        .iter()
        .filter_map(|call| match call {
            PlatformCall::Create { context } if *context > 2 => Some(*context),
            _ => None,
        })
        .collect();
    assert!(journal_before_gesture.iter().all(|call| {
        !matches!(call, PlatformCall::Resume { context, .. } if recreated.contains(context))
    }));
    assert_eq!(
        manager
            .playback()
            .when_ready_within(Duration::from_secs(1))
            .await,
        Err(ContextError::ReadyTimeout(Duration::from_secs(1)))
    );

    gate.report_interaction(InteractionKind::Click);
    for purpose in ContextPurpose::ALL {
        let after = manager
            .source(purpose)
            .when_ready_within(Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(after, before);
    }
    assert!(platform.journal().iter().any(|call| matches!(
        call,
        PlatformCall::Resume { context, gesture: true } if recreated.contains(context)
    )));

    manager.dispose().await;
}
