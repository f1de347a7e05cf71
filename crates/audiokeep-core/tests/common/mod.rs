//! Shared helpers for the integration tests.
//!
//! All tests run on paused tokio time, so sleeps here cost nothing and
//! debounces/cycles elapse deterministically.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use audiokeep_core::{
    ContextChange, ContextLease, ContextPurpose, ContextSource, InteractionGate, InteractionKind,
    SessionConfig, SimulatedPlatform,
};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A playback source on `platform` with a gate matching its capability.
pub fn spawn_source(
    platform: &SimulatedPlatform,
    config: &SessionConfig,
) -> (ContextSource, InteractionGate) {
    init_logging();
    let gate = InteractionGate::new();
    if audiokeep_core::AudioPlatform::is_always_interactive(platform) {
        gate.set_always_interactive(true);
    }
    let source = ContextSource::spawn(
        ContextPurpose::Playback,
        Arc::new(platform.clone()),
        gate.clone(),
        config,
    );
    (source, gate)
}

/// Poll `condition` every 10ms of virtual time; panic after 120s.
pub async fn until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..12_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Wait until something waits on the gate, deliver one gesture, then wait
/// until the waiter has consumed it.
pub async fn gesture_when_awaited(gate: &InteractionGate) {
    until("a gesture waiter", || gate.waiter_count() > 0).await;
    gate.report_interaction(InteractionKind::Click);
    until("gesture waiters to settle", || gate.waiter_count() == 0).await;
}

/// Drain every change already delivered to `lease`.
pub fn drain_changes(lease: &mut ContextLease) -> Vec<ContextChange> {
    std::iter::from_fn(|| lease.try_next_change()).collect()
}

/// Check that a change sequence starts with `NotReady`, alternates and
/// only ends with `Disposed`.
pub fn assert_alternates(changes: &[ContextChange]) {
    assert!(
        matches!(changes.first(), Some(ContextChange::NotReady)),
        "first change must be NotReady: {changes:?}"
    );
    for pair in changes.windows(2) {
        match (&pair[0], &pair[1]) {
            (ContextChange::NotReady, ContextChange::Ready(_))
            | (ContextChange::Ready(_), ContextChange::NotReady)
            | (ContextChange::NotReady | ContextChange::Ready(_), ContextChange::Disposed) => {}
            (previous, next) => panic!("{previous:?} followed by {next:?} in {changes:?}"),
        }
    }
}
