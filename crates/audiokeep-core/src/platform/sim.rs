//! Simulated gesture-gated audio platform.
//!
//! Behaves like a browser audio stack: contexts only start from a user
//! gesture (or once the page holds user activation), the render clock runs on
//! tokio time, and a device sleep revokes user activation. Faults can be
//! injected to exercise the repair paths, and every lifecycle call is
//! journaled so tests can check ordering properties after the fact.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::time::Instant;

use super::{
    Activation, AudioPlatform, ContextOptions, ContextState, PlatformContext, PlatformFuture,
};
use crate::error::PlatformError;

/// Latency of simulated resume/suspend/close calls.
const CALL_LATENCY: Duration = Duration::from_millis(10);

/// Latency of loading one processing module.
const MODULE_LATENCY: Duration = Duration::from_millis(5);

/// A journaled platform call. `context` is the simulator's 1-based ordinal
/// of the context involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Create { context: u64 },
    LoadModule { context: u64, name: String },
    Resume { context: u64, gesture: bool },
    Suspend { context: u64 },
    Close { context: u64 },
}

impl PlatformCall {
    pub const fn context(&self) -> u64 {
        match self {
            Self::Create { context }
            | Self::LoadModule { context, .. }
            | Self::Resume { context, .. }
            | Self::Suspend { context }
            | Self::Close { context } => *context,
        }
    }
}

type CloseHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct Faults {
    fail_creates: u32,
    fail_modules: HashMap<String, u32>,
    hang_resumes: u32,
    fail_resumes: u32,
    hang_suspends: u32,
    fail_suspends: u32,
    stall_contexts: u32,
}

fn failed(err: PlatformError) -> PlatformFuture {
    futures_util::future::ready(Err(err)).boxed()
}

fn never() -> PlatformFuture {
    futures_util::future::pending::<Result<(), PlatformError>>().boxed()
}

/// Take one occurrence of a counted fault.
fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

struct SimShared {
    always_interactive: AtomicBool,
    user_activation: AtomicBool,
    next_ordinal: AtomicU64,
    faults: Mutex<Faults>,
    journal: Mutex<Vec<PlatformCall>>,
    contexts: Mutex<Vec<Weak<SimulatedContext>>>,
    close_hook: Mutex<Option<CloseHook>>,
}

impl SimShared {
    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: PlatformCall) {
        tracing::trace!(?call, "Simulated platform call");
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn live_contexts(&self) -> Vec<Arc<SimulatedContext>> {
        let mut contexts = self
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        contexts.retain(|weak| weak.strong_count() > 0);
        contexts.iter().filter_map(Weak::upgrade).collect()
    }

    fn may_start_autonomously(&self) -> bool {
        self.always_interactive.load(Ordering::SeqCst)
            || self.user_activation.load(Ordering::SeqCst)
    }
}

/// In-process stand-in for a browser-like audio platform.
///
/// Cloning shares the same simulated platform.
#[derive(Clone)]
pub struct SimulatedPlatform {
    shared: Arc<SimShared>,
}

impl SimulatedPlatform {
    /// A gesture-gated platform without user activation.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                always_interactive: AtomicBool::new(false),
                user_activation: AtomicBool::new(false),
                next_ordinal: AtomicU64::new(1),
                faults: Mutex::new(Faults::default()),
                journal: Mutex::new(Vec::new()),
                contexts: Mutex::new(Vec::new()),
                close_hook: Mutex::new(None),
            }),
        }
    }

    /// A platform that never requires gestures.
    pub fn always_interactive() -> Self {
        let platform = Self::new();
        platform
            .shared
            .always_interactive
            .store(true, Ordering::SeqCst);
        platform
    }

    /// Whether a gesture has granted user activation since the last sleep.
    pub fn has_user_activation(&self) -> bool {
        self.shared.user_activation.load(Ordering::SeqCst)
    }

    // ── Fault injection ────────────────────────────────────────────────────

    pub fn fail_next_creates(&self, count: u32) {
        self.shared.faults().fail_creates += count;
    }

    pub fn fail_module_load(&self, name: &str, count: u32) {
        *self
            .shared
            .faults()
            .fail_modules
            .entry(name.to_string())
            .or_default() += count;
    }

    /// The next `count` resumes never complete.
    pub fn hang_next_resumes(&self, count: u32) {
        self.shared.faults().hang_resumes += count;
    }

    pub fn fail_next_resumes(&self, count: u32) {
        self.shared.faults().fail_resumes += count;
    }

    /// The next `count` suspends never complete.
    pub fn hang_next_suspends(&self, count: u32) {
        self.shared.faults().hang_suspends += count;
    }

    pub fn fail_next_suspends(&self, count: u32) {
        self.shared.faults().fail_suspends += count;
    }

    /// The next `count` contexts report running but keep their clock still
    /// until they receive a ping.
    pub fn stall_next_contexts(&self, count: u32) {
        self.shared.faults().stall_contexts += count;
    }

    /// Silently stop the render clock of every live context. They keep
    /// reporting their current state.
    pub fn freeze_clocks(&self) {
        for context in self.shared.live_contexts() {
            context.set_clock(ClockMode::Frozen);
        }
    }

    /// Suspend every live context from outside, like a browser does when the
    /// output device goes away.
    pub fn suspend_externally(&self) {
        for context in self.shared.live_contexts() {
            context.transition(ContextState::Suspended);
        }
    }

    /// Simulate the device going to sleep and waking up: user activation is
    /// revoked and every live context is suspended.
    pub fn simulate_sleep(&self) {
        self.shared.user_activation.store(false, Ordering::SeqCst);
        self.suspend_externally();
        tracing::debug!("Simulated device sleep");
    }

    /// Run `hook` synchronously whenever `close` is invoked on a context.
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *self
            .shared
            .close_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    pub fn journal(&self) -> Vec<PlatformCall> {
        self.shared
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Contexts that were created and not closed yet.
    pub fn live_context_count(&self) -> usize {
        self.shared
            .live_contexts()
            .iter()
            .filter(|context| context.state() != ContextState::Closed)
            .count()
    }

    pub fn created_count(&self) -> usize {
        self.count_calls(|call| matches!(call, PlatformCall::Create { .. }))
    }

    pub fn closed_count(&self) -> usize {
        self.count_calls(|call| matches!(call, PlatformCall::Close { .. }))
    }

    pub fn resume_count(&self) -> usize {
        self.count_calls(|call| matches!(call, PlatformCall::Resume { .. }))
    }

    fn count_calls(&self, predicate: impl Fn(&PlatformCall) -> bool) -> usize {
        self.shared
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedPlatform")
            .field(
                "always_interactive",
                &self.shared.always_interactive.load(Ordering::SeqCst),
            )
            .field("user_activation", &self.has_user_activation())
            .field("live_contexts", &self.live_context_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AudioPlatform for SimulatedPlatform {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_always_interactive(&self) -> bool {
        self.shared.always_interactive.load(Ordering::SeqCst)
    }

    async fn create(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn PlatformContext>, PlatformError> {
        let stalled = {
            let mut faults = self.shared.faults();
            if take(&mut faults.fail_creates) {
                return Err(PlatformError::Create(
                    "simulated construction failure".to_string(),
                ));
            }
            take(&mut faults.stall_contexts)
        };

        let ordinal = self.shared.next_ordinal.fetch_add(1, Ordering::SeqCst);
        self.shared.record(PlatformCall::Create { context: ordinal });

        // A page that already holds user activation gets a running context.
        let state = if self.shared.may_start_autonomously() {
            ContextState::Running
        } else {
            ContextState::Suspended
        };
        let clock = if stalled {
            ClockMode::StalledUntilPing
        } else {
            ClockMode::Normal
        };

        let context = Arc::new_cyclic(|this| SimulatedContext {
            this: this.clone(),
            ordinal,
            sample_rate: options.sample_rate,
            shared: Arc::clone(&self.shared),
            clock: Mutex::new(Clock::new(state, clock)),
        });
        self.shared
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&context));

        Ok(context)
    }
}

// ── Context ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockMode {
    Normal,
    StalledUntilPing,
    Frozen,
}

#[derive(Debug)]
struct Clock {
    state: ContextState,
    mode: ClockMode,
    elapsed: f64,
    running_since: Option<Instant>,
}

impl Clock {
    fn new(state: ContextState, mode: ClockMode) -> Self {
        let mut clock = Self {
            state: ContextState::Initializing,
            mode,
            elapsed: 0.0,
            running_since: None,
        };
        clock.set_state(state);
        clock
    }

    const fn ticking(&self) -> bool {
        matches!(self.state, ContextState::Running) && matches!(self.mode, ClockMode::Normal)
    }

    fn now(&self) -> f64 {
        self.running_since.map_or(self.elapsed, |since| {
            self.elapsed + since.elapsed().as_secs_f64()
        })
    }

    fn settle(&mut self) {
        self.elapsed = self.now();
        self.running_since = None;
    }

    fn set_state(&mut self, state: ContextState) {
        self.settle();
        self.state = state;
        if self.ticking() {
            self.running_since = Some(Instant::now());
        }
    }

    fn set_mode(&mut self, mode: ClockMode) {
        self.settle();
        self.mode = mode;
        if self.ticking() {
            self.running_since = Some(Instant::now());
        }
    }
}

/// A context created by [`SimulatedPlatform`].
pub struct SimulatedContext {
    this: Weak<SimulatedContext>,
    ordinal: u64,
    sample_rate: u32,
    shared: Arc<SimShared>,
    clock: Mutex<Clock>,
}

impl SimulatedContext {
    /// The simulator's 1-based ordinal of this context.
    pub const fn ordinal(&self) -> u64 {
        self.ordinal
    }

    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: ContextState) {
        let mut clock = self.clock();
        if clock.state != ContextState::Closed {
            clock.set_state(state);
        }
    }

    fn set_clock(&self, mode: ClockMode) {
        self.clock().set_mode(mode);
    }

    /// Apply `state` after the call latency, unless the context closed in
    /// the meantime.
    fn settle_after(self: Arc<Self>, state: ContextState) -> PlatformFuture {
        async move {
            tokio::time::sleep(CALL_LATENCY).await;
            let mut clock = self.clock();
            if clock.state == ContextState::Closed {
                return Err(PlatformError::Closed);
            }
            clock.set_state(state);
            Ok(())
        }
        .boxed()
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }
}

impl fmt::Debug for SimulatedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock = self.clock();
        f.debug_struct("SimulatedContext")
            .field("ordinal", &self.ordinal)
            .field("state", &clock.state)
            .field("mode", &clock.mode)
            .finish_non_exhaustive()
    }
}

impl PlatformContext for SimulatedContext {
    fn state(&self) -> ContextState {
        self.clock().state
    }

    fn current_time(&self) -> f64 {
        self.clock().now()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn ping(&self) -> bool {
        let mut clock = self.clock();
        if clock.state != ContextState::Running {
            return false;
        }
        if clock.mode == ClockMode::StalledUntilPing {
            clock.set_mode(ClockMode::Normal);
        }
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn load_module(&self, name: &str) -> PlatformFuture {
        self.shared.record(PlatformCall::LoadModule {
            context: self.ordinal,
            name: name.to_string(),
        });
        let fails = self
            .shared
            .faults()
            .fail_modules
            .get_mut(name)
            .is_some_and(take);
        let name = name.to_string();
        async move {
            tokio::time::sleep(MODULE_LATENCY).await;
            if fails {
                Err(PlatformError::ModuleLoad {
                    name,
                    reason: "simulated module load failure".to_string(),
                })
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    fn resume(&self, activation: Activation<'_>) -> PlatformFuture {
        let gesture = activation.is_gesture();
        self.shared.record(PlatformCall::Resume {
            context: self.ordinal,
            gesture,
        });
        if gesture {
            self.shared.user_activation.store(true, Ordering::SeqCst);
        }

        if self.state() == ContextState::Closed {
            return failed(PlatformError::Closed);
        }

        let (hang, fail) = {
            let mut faults = self.shared.faults();
            let hang = take(&mut faults.hang_resumes);
            let fail = !hang && take(&mut faults.fail_resumes);
            (hang, fail)
        };
        if fail {
            return failed(PlatformError::Resume(
                "simulated resume failure".to_string(),
            ));
        }
        // Without activation the platform leaves the promise pending.
        if hang || !self.shared.may_start_autonomously() {
            return never();
        }

        match self.strong() {
            Some(context) => context.settle_after(ContextState::Running),
            None => failed(PlatformError::OwnerGone),
        }
    }

    fn suspend(&self) -> PlatformFuture {
        self.shared.record(PlatformCall::Suspend {
            context: self.ordinal,
        });
        if self.state() == ContextState::Closed {
            return failed(PlatformError::Closed);
        }

        let (hang, fail) = {
            let mut faults = self.shared.faults();
            let hang = take(&mut faults.hang_suspends);
            let fail = !hang && take(&mut faults.fail_suspends);
            (hang, fail)
        };
        if hang {
            return never();
        }
        if fail {
            return failed(PlatformError::Suspend(
                "simulated suspend failure".to_string(),
            ));
        }

        match self.strong() {
            Some(context) => context.settle_after(ContextState::Suspended),
            None => failed(PlatformError::OwnerGone),
        }
    }

    fn close(&self) -> PlatformFuture {
        self.shared.record(PlatformCall::Close {
            context: self.ordinal,
        });
        let hook = self
            .shared
            .close_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(self.ordinal);
        }

        let result = {
            let mut clock = self.clock();
            if clock.state == ContextState::Closed {
                Err(PlatformError::Closed)
            } else {
                clock.set_state(ContextState::Closed);
                Ok(())
            }
        };
        async move {
            tokio::time::sleep(CALL_LATENCY).await;
            result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ContextPurpose, LatencyHint};

    fn options() -> ContextOptions {
        ContextOptions {
            purpose: ContextPurpose::Playback,
            sample_rate: 48_000,
            latency_hint: LatencyHint::Balanced,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gated_context_starts_suspended_and_ignores_autonomous_resume() {
        let platform = SimulatedPlatform::new();
        let context = platform.create(&options()).await.unwrap();
        assert_eq!(context.state(), ContextState::Suspended);

        let resume = context.resume(Activation::Autonomous);
        let outcome = tokio::time::timeout(Duration::from_secs(1), resume).await;
        assert!(outcome.is_err(), "autonomous resume must stay pending");
        assert_eq!(context.state(), ContextState::Suspended);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_advances_only_while_running() {
        let platform = SimulatedPlatform::always_interactive();
        let context = platform.create(&options()).await.unwrap();
        assert_eq!(context.state(), ContextState::Running);

        let t0 = context.current_time();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let t1 = context.current_time();
        assert!(t1 - t0 >= 0.49);

        context.suspend().await.unwrap();
        let t2 = context.current_time();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((context.current_time() - t2).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_clock_recovers_on_ping_but_frozen_does_not() {
        let platform = SimulatedPlatform::always_interactive();
        platform.stall_next_contexts(1);
        let stalled = platform.create(&options()).await.unwrap();

        let t0 = stalled.current_time();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!((stalled.current_time() - t0).abs() < f64::EPSILON);
        assert!(stalled.ping());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(stalled.current_time() > t0);

        platform.freeze_clocks();
        let t1 = stalled.current_time();
        assert!(stalled.ping());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!((stalled.current_time() - t1).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_revokes_activation_and_suspends() {
        let platform = SimulatedPlatform::always_interactive();
        let context = platform.create(&options()).await.unwrap();

        platform.simulate_sleep();
        assert_eq!(context.state(), ContextState::Suspended);
        assert!(!platform.has_user_activation());
    }

    #[tokio::test(start_paused = true)]
    async fn faults_are_consumed_in_order() {
        let platform = SimulatedPlatform::always_interactive();
        platform.fail_next_creates(1);
        assert!(platform.create(&options()).await.is_err());

        let context = platform.create(&options()).await.unwrap();
        platform.fail_module_load("vad", 1);
        assert!(context.load_module("vad").await.is_err());
        assert!(context.load_module("vad").await.is_ok());

        platform.fail_next_suspends(1);
        assert!(context.suspend().await.is_err());
        context.close().await.unwrap();
        assert_eq!(context.close().await, Err(PlatformError::Closed));

        assert_eq!(platform.created_count(), 1);
        assert_eq!(platform.closed_count(), 2);
        assert_eq!(platform.live_context_count(), 0);
    }
}
