//! Self-healing audio context sources.
//!
//! A [`ContextSource`] owns at most one platform context for one purpose and
//! runs a maintenance loop that creates, activates, tests, repairs, idles
//! down and recreates it. Consumers never see the loop; they acquire
//! [`ContextLease`]s and wait for readiness.

mod health;
mod maintain;
mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{PurposeConfig, SessionConfig, SourceConfig};
use crate::error::ContextError;
use crate::events::{SourceEvent, SourceEventBroadcaster, SourceEventKind};
use crate::gate::InteractionGate;
use crate::lease::{ContextLease, LeaseId, LeaseObserver, LeaseShared};
use crate::platform::{AudioContextHandle, AudioPlatform, ContextId, ContextPurpose, ContextState};

use maintain::Maintainer;
pub(crate) use registry::Readiness;
use registry::Registry;

// ── Public state types ─────────────────────────────────────────────────────

/// States of the maintenance loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintainState {
    NoHandle,
    Creating,
    Testing,
    Healthy,
    Broken,
    Fixing,
    Closing,
}

impl fmt::Display for MaintainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoHandle => "no_handle",
            Self::Creating => "creating",
            Self::Testing => "testing",
            Self::Healthy => "healthy",
            Self::Broken => "broken",
            Self::Fixing => "fixing",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Host visibility, reported by the UI shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundState {
    #[default]
    Foreground,
    /// In the background with nothing audible going on.
    BackgroundIdle,
    /// In the background but still playing or recording.
    BackgroundActive,
}

/// Point-in-time snapshot of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub purpose: ContextPurpose,
    pub state: MaintainState,
    /// The maintenance loop is running.
    pub is_active: bool,
    /// A healthy context is announced to leases.
    pub is_ready: bool,
    pub context_id: Option<ContextId>,
    pub context_state: Option<ContextState>,
    pub resume_count: u32,
    pub interactive_resume_count: u32,
    pub lease_count: usize,
    pub leases_in_use: usize,
    pub leases_by_operation: BTreeMap<String, usize>,
    pub background: BackgroundState,
    pub awaiting_gesture: bool,
    pub disposed: bool,
}

// ── Shared state ───────────────────────────────────────────────────────────

struct Runner {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub(crate) struct SourceInner {
    purpose: ContextPurpose,
    config: SourceConfig,
    purpose_config: PurposeConfig,
    platform: Arc<dyn AudioPlatform>,
    gate: InteractionGate,

    registry: Mutex<Registry>,
    readiness: watch::Sender<Readiness>,
    /// Bumped whenever lease demand may have changed.
    activity: watch::Sender<u64>,
    background: watch::Sender<BackgroundState>,
    /// Set on entering `BackgroundIdle`; consumed by the idle suspend.
    idle_armed: AtomicBool,
    wakes: watch::Sender<u64>,
    /// Bumped by `reset`. Bumps happen under the registry lock.
    restarts: watch::Sender<u64>,
    state: watch::Sender<MaintainState>,
    events: SourceEventBroadcaster,

    live: Mutex<Option<AudioContextHandle>>,
    resume_count: AtomicU32,
    interactive_resume_count: AtomicU32,
    awaiting_gesture: AtomicBool,
    next_lease_id: AtomicU64,

    disposing: AtomicBool,
    root: CancellationToken,
    runner: tokio::sync::Mutex<Option<Runner>>,
}

impl SourceInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> MutexGuard<'_, Option<AudioContextHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bump_activity(&self) {
        self.activity.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) async fn when_ready(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AudioContextHandle, ContextError> {
        let mut rx = self.readiness.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Readiness::Ready(handle) => return Ok(handle),
                Readiness::Disposed => return Err(ContextError::Disposed),
                Readiness::NotReady => {}
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ContextError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ContextError::Disposed);
                    }
                }
            }
        }
    }

    pub(crate) fn begin_use(&self, lease: &LeaseShared, handle: &AudioContextHandle) -> bool {
        let started = self.registry().begin_use(lease, handle);
        if started {
            self.bump_activity();
        }
        started
    }

    pub(crate) fn unregister(&self, lease: &LeaseShared) {
        let (removed, remaining) = {
            let mut registry = self.registry();
            let removed = registry.unregister(lease);
            (removed, registry.len())
        };
        if removed {
            tracing::debug!(
                purpose = %self.purpose,
                lease_id = %lease.id,
                lease_count = remaining,
                "Lease released"
            );
            self.bump_activity();
        }
    }

    /// Announce `handle` to every lease. Returns `false` if already ready,
    /// or if a reset was requested after restart `epoch`.
    fn mark_ready(&self, handle: &AudioContextHandle, epoch: u64) -> bool {
        let flipped = {
            let mut registry = self.registry();
            if *self.restarts.borrow() != epoch {
                return false;
            }
            let flipped = registry.mark_ready(handle);
            if flipped {
                self.readiness.send_replace(registry.readiness());
            }
            flipped
        };
        if flipped {
            tracing::info!(
                purpose = %self.purpose,
                context_id = %handle.id(),
                "Audio context ready"
            );
            self.events.emit(SourceEventKind::Ready {
                context_id: handle.id(),
            });
        }
        flipped
    }

    /// Withdraw readiness. Returns `false` if not ready.
    fn mark_not_ready(&self) -> bool {
        let flipped = {
            let mut registry = self.registry();
            let flipped = registry.mark_not_ready();
            if flipped {
                self.readiness.send_replace(registry.readiness());
            }
            flipped
        };
        if flipped {
            tracing::debug!(purpose = %self.purpose, "Audio context not ready");
            self.events.emit(SourceEventKind::NotReady);
        }
        flipped
    }

    /// Withdraw readiness and tell the loop to start over. The old context
    /// can't be announced again once this returns.
    fn request_restart(&self) {
        let flipped = {
            let mut registry = self.registry();
            self.restarts.send_modify(|n| *n = n.wrapping_add(1));
            let flipped = registry.mark_not_ready();
            if flipped {
                self.readiness.send_replace(registry.readiness());
            }
            flipped
        };
        if flipped {
            self.events.emit(SourceEventKind::NotReady);
        }
    }

    /// Synchronous part of disposal: stop the loop, close the registry and
    /// publish `Disposed`. Returns the leases that still need disposing.
    fn shut_down(&self) -> Vec<Arc<LeaseShared>> {
        self.root.cancel();
        let leases = {
            let mut registry = self.registry();
            let leases = registry.dispose();
            self.readiness.send_replace(registry.readiness());
            leases
        };
        self.bump_activity();
        leases
    }

    fn set_state(&self, state: MaintainState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(purpose = %self.purpose, %state, "Maintenance state");
            self.events.emit(SourceEventKind::StateChanged { state });
        }
    }

    fn has_leases_in_use(&self) -> bool {
        self.registry().any_in_use()
    }

    fn has_waiting_leases(&self) -> bool {
        self.registry().any_waiting()
    }

    fn background(&self) -> BackgroundState {
        *self.background.borrow()
    }

    fn reset_counters(&self) {
        self.resume_count.store(0, Ordering::SeqCst);
        self.interactive_resume_count.store(0, Ordering::SeqCst);
    }

    fn counters(&self) -> (u32, u32) {
        (
            self.resume_count.load(Ordering::SeqCst),
            self.interactive_resume_count.load(Ordering::SeqCst),
        )
    }

    /// Bring every lease observer in line with `target`, in lease order.
    async fn sync_observers(&self, target: Option<&AudioContextHandle>) {
        let observed = self.registry().observed();
        for lease in observed {
            lease.sync_observer(target).await;
        }
    }

    fn start_runner(self: &Arc<Self>) -> Runner {
        let cancel = self.root.child_token();
        let maintainer = Maintainer::new(Arc::clone(self), cancel.clone());
        let join = tokio::spawn(maintainer.run());
        Runner { cancel, join }
    }

    async fn stop_runner(&self) {
        let runner = self.runner.lock().await.take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(e) = runner.join.await {
                tracing::error!(purpose = %self.purpose, error = %e, "Maintenance task failed");
            }
        }
    }
}

// ── ContextSource ──────────────────────────────────────────────────────────

/// Self-healing provider of one purpose's audio context.
///
/// Cheap to clone; clones share the same source. The maintenance loop runs
/// on the tokio runtime from [`spawn`](Self::spawn) until
/// [`dispose`](Self::dispose).
#[derive(Clone)]
pub struct ContextSource {
    inner: Arc<SourceInner>,
}

impl ContextSource {
    /// Create a source and start its maintenance loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        purpose: ContextPurpose,
        platform: Arc<dyn AudioPlatform>,
        gate: InteractionGate,
        config: &SessionConfig,
    ) -> Self {
        let (readiness, _) = watch::channel(Readiness::NotReady);
        let (activity, _) = watch::channel(0);
        let (background, _) = watch::channel(BackgroundState::Foreground);
        let (wakes, _) = watch::channel(0);
        let (restarts, _) = watch::channel(0);
        let (state, _) = watch::channel(MaintainState::NoHandle);

        let inner = Arc::new(SourceInner {
            purpose,
            config: config.source.clone(),
            purpose_config: config.purpose(purpose).clone(),
            platform,
            gate,
            registry: Mutex::new(Registry::default()),
            readiness,
            activity,
            background,
            idle_armed: AtomicBool::new(false),
            wakes,
            restarts,
            state,
            events: SourceEventBroadcaster::new(purpose),
            live: Mutex::new(None),
            resume_count: AtomicU32::new(0),
            interactive_resume_count: AtomicU32::new(0),
            awaiting_gesture: AtomicBool::new(false),
            next_lease_id: AtomicU64::new(1),
            disposing: AtomicBool::new(false),
            root: CancellationToken::new(),
            runner: tokio::sync::Mutex::new(None),
        });

        let runner = inner.start_runner();
        // Freshly created and not shared yet, so the lock is free.
        if let Ok(mut slot) = inner.runner.try_lock() {
            *slot = Some(runner);
        }

        tracing::info!(
            %purpose,
            platform = inner.platform.name(),
            "Context source started"
        );
        Self { inner }
    }

    pub fn purpose(&self) -> ContextPurpose {
        self.inner.purpose
    }

    pub fn gate(&self) -> &InteractionGate {
        &self.inner.gate
    }

    /// Claim the source's context. Never blocks.
    pub fn acquire(&self, operation: impl Into<String>) -> Result<ContextLease, ContextError> {
        self.acquire_inner(operation.into(), None)
    }

    /// Claim the source's context with lifecycle callbacks.
    pub fn acquire_with(
        &self,
        operation: impl Into<String>,
        observer: Arc<dyn LeaseObserver>,
    ) -> Result<ContextLease, ContextError> {
        self.acquire_inner(operation.into(), Some(observer))
    }

    fn acquire_inner(
        &self,
        operation: String,
        observer: Option<Arc<dyn LeaseObserver>>,
    ) -> Result<ContextLease, ContextError> {
        if self.is_disposed() {
            return Err(ContextError::Disposed);
        }
        let id = LeaseId(self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed));
        let (shared, changes) =
            LeaseShared::new(id, operation, self.inner.root.child_token(), observer);
        let (total, per_operation) = self.inner.registry().register(Arc::clone(&shared))?;

        if total > self.inner.config.high_lease_count {
            tracing::warn!(
                purpose = %self.inner.purpose,
                operation = %shared.operation,
                lease_count = total,
                operation_count = per_operation,
                "High lease count, leases may be leaking"
            );
        } else {
            tracing::debug!(
                purpose = %self.inner.purpose,
                lease_id = %id,
                operation = %shared.operation,
                lease_count = total,
                "Lease acquired"
            );
        }
        self.inner.bump_activity();

        Ok(ContextLease::new(shared, Arc::clone(&self.inner), changes))
    }

    /// Resolve with the current healthy context.
    ///
    /// Never resolves if the source can't become ready; pass a token (or use
    /// [`when_ready_within`](Self::when_ready_within)) to bound the wait.
    pub async fn when_ready(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AudioContextHandle, ContextError> {
        self.inner.when_ready(cancel).await
    }

    pub async fn when_ready_within(
        &self,
        timeout: Duration,
    ) -> Result<AudioContextHandle, ContextError> {
        let never = CancellationToken::new();
        tokio::time::timeout(timeout, self.inner.when_ready(&never))
            .await
            .map_err(|_| ContextError::ReadyTimeout(timeout))?
    }

    /// The currently announced healthy context, if any.
    pub fn current(&self) -> Option<AudioContextHandle> {
        self.inner.registry().current().cloned()
    }

    /// Close the current context and restart maintenance from scratch.
    ///
    /// Returns once readiness is withdrawn; the next ready context is a new
    /// one. The old context is closed in the background after in-flight
    /// `use_context` work on it finishes, so this may be called from inside
    /// `use_context`.
    pub async fn reset(&self) -> Result<(), ContextError> {
        if self.is_disposed() {
            return Err(ContextError::Disposed);
        }
        self.inner.request_restart();
        tracing::info!(purpose = %self.inner.purpose, "Context source reset");
        Ok(())
    }

    /// Report a host visibility change.
    pub fn update_background_state(&self, state: BackgroundState) {
        let changed = self.inner.background.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.inner
                .idle_armed
                .store(state == BackgroundState::BackgroundIdle, Ordering::SeqCst);
            tracing::debug!(purpose = %self.inner.purpose, ?state, "Background state changed");
        }
    }

    pub fn background_state(&self) -> BackgroundState {
        self.inner.background()
    }

    /// Force the live context to be recreated after a device wake.
    pub fn on_device_wake(&self) {
        self.inner.wakes.send_modify(|n| *n = n.wrapping_add(1));
        tracing::info!(purpose = %self.inner.purpose, "Device wake, recreating audio context");
    }

    /// Mark the live context broken so the next health test fails.
    pub fn break_context(&self) {
        if let Some(handle) = self.inner.live().as_ref() {
            handle.mark_broken();
            tracing::warn!(
                purpose = %self.inner.purpose,
                context_id = %handle.id(),
                "Audio context marked as broken"
            );
        }
    }

    /// Stop maintenance, close the live context and dispose every lease.
    /// Idempotent.
    ///
    /// Readiness turns `Disposed` and every lease is released before the
    /// first await. The rest of the teardown runs on its own task, so it
    /// completes even if this future is dropped.
    pub async fn dispose(&self) {
        if self.inner.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(purpose = %self.inner.purpose, "Disposing context source");

        let leases = self.inner.shut_down();
        for lease in &leases {
            lease.cancel.cancel();
        }

        let inner = Arc::clone(&self.inner);
        let teardown = tokio::spawn(async move {
            inner.stop_runner().await;
            for lease in &leases {
                if lease.begin_dispose() {
                    lease.finish_observer().await;
                }
            }
            tracing::info!(
                purpose = %inner.purpose,
                leases = leases.len(),
                "Context source disposed"
            );
        });
        if let Err(e) = teardown.await {
            tracing::error!(purpose = %self.inner.purpose, error = %e, "Context source teardown failed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposing.load(Ordering::SeqCst) || self.inner.registry().is_disposed()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the maintenance state.
    pub fn watch_state(&self) -> watch::Receiver<MaintainState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> MaintainState {
        *self.inner.state.borrow()
    }

    pub fn lease_count(&self) -> usize {
        self.inner.registry().len()
    }

    /// Whether any lease is running work against the context right now.
    pub fn has_leases_in_use(&self) -> bool {
        self.inner.has_leases_in_use()
    }

    pub fn status(&self) -> SourceStatus {
        let (ready, lease_count, leases_in_use, leases_by_operation, disposed) = {
            let registry = self.inner.registry();
            (
                registry.current().is_some(),
                registry.len(),
                registry.in_use_count(),
                registry.per_operation(),
                registry.is_disposed(),
            )
        };
        let live = self.inner.live().clone();
        let (resume_count, interactive_resume_count) = self.inner.counters();
        let is_active = !disposed
            && self
                .inner
                .runner
                .try_lock()
                .map_or(true, |runner| runner.as_ref().is_some_and(|r| !r.join.is_finished()));

        SourceStatus {
            purpose: self.inner.purpose,
            state: self.state(),
            is_active,
            is_ready: ready,
            context_id: live.as_ref().map(AudioContextHandle::id),
            context_state: live.as_ref().map(AudioContextHandle::state),
            resume_count,
            interactive_resume_count,
            lease_count,
            leases_in_use,
            leases_by_operation,
            background: self.inner.background(),
            awaiting_gesture: self.inner.awaiting_gesture.load(Ordering::SeqCst),
            disposed: disposed || self.inner.disposing.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSource")
            .field("purpose", &self.inner.purpose)
            .field("state", &self.state())
            .field("lease_count", &self.lease_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::ContextChange;
    use crate::platform::sim::SimulatedPlatform;
    use crate::test_support::init_logging;

    fn source_on(platform: &SimulatedPlatform) -> ContextSource {
        init_logging();
        let gate = InteractionGate::new();
        gate.set_always_interactive(platform.is_always_interactive());
        ContextSource::spawn(
            ContextPurpose::Playback,
            Arc::new(platform.clone()),
            gate,
            &SessionConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_ready_and_reports_status() {
        let platform = SimulatedPlatform::always_interactive();
        let source = source_on(&platform);
        let _player = source.acquire("player").unwrap();
        let _other = source.acquire("player").unwrap();
        let _recorder = source.acquire("recorder").unwrap();

        let handle = source
            .when_ready_within(Duration::from_secs(5))
            .await
            .unwrap();
        let status = source.status();

        assert_eq!(status.state, MaintainState::Healthy);
        assert!(status.is_active);
        assert!(status.is_ready);
        assert_eq!(status.context_id, Some(handle.id()));
        assert_eq!(status.context_state, Some(ContextState::Running));
        assert_eq!(status.lease_count, 3);
        assert_eq!(status.leases_by_operation.get("player"), Some(&2));
        assert_eq!(source.current(), Some(handle));

        source.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn when_ready_honours_cancellation() {
        let platform = SimulatedPlatform::new();
        let source = source_on(&platform);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(
            source.when_ready(&token).await,
            Err(ContextError::Cancelled)
        );
        assert_eq!(
            source.when_ready_within(Duration::from_secs(1)).await,
            Err(ContextError::ReadyTimeout(Duration::from_secs(1)))
        );
        source.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent_and_terminal() {
        let platform = SimulatedPlatform::always_interactive();
        let source = source_on(&platform);
        let mut lease = source.acquire("player").unwrap();
        source.when_ready_within(Duration::from_secs(5)).await.unwrap();

        source.dispose().await;
        source.dispose().await;

        assert!(source.is_disposed());
        assert_eq!(platform.live_context_count(), 0);
        assert_eq!(platform.closed_count(), 1);
        assert!(matches!(source.acquire("late"), Err(ContextError::Disposed)));
        assert_eq!(source.reset().await, Err(ContextError::Disposed));
        assert_eq!(lease.when_ready().await, Err(ContextError::Disposed));

        let mut changes = Vec::new();
        while let Some(change) = lease.try_next_change() {
            changes.push(change);
        }
        assert!(matches!(changes.last(), Some(ContextChange::Disposed)));
        assert_eq!(
            changes
                .iter()
                .filter(|change| matches!(change, ContextChange::Disposed))
                .count(),
            1
        );
        assert!(!source.status().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_replaces_the_context() {
        let platform = SimulatedPlatform::always_interactive();
        let source = source_on(&platform);
        let first = source.when_ready_within(Duration::from_secs(5)).await.unwrap();

        source.reset().await.unwrap();
        assert!(source.current().is_none());

        let second = source.when_ready_within(Duration::from_secs(5)).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(first.state(), ContextState::Closed);
        assert_eq!(platform.live_context_count(), 1);

        source.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failures_are_retried() {
        let platform = SimulatedPlatform::always_interactive();
        platform.fail_next_creates(2);
        let source = source_on(&platform);

        source.when_ready_within(Duration::from_secs(10)).await.unwrap();
        assert_eq!(platform.created_count(), 1);

        source.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_module_load_closes_the_context() {
        let platform = SimulatedPlatform::always_interactive();
        platform.fail_module_load("opus-encoder", 1);
        let source = source_on(&platform);

        source.when_ready_within(Duration::from_secs(10)).await.unwrap();
        assert_eq!(platform.created_count(), 2);
        assert_eq!(platform.closed_count(), 1);
        assert_eq!(platform.live_context_count(), 1);

        source.dispose().await;
    }
}
