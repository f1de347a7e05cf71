//! Platform audio ports.
//!
//! A platform builds [`PlatformContext`]s: externally owned audio device
//! contexts with a render clock and async lifecycle calls. The core never
//! talks to a platform API directly; it goes through these traits so the same
//! maintenance loop drives both gesture-gated and always-interactive hosts.
//!
//! Consumers only ever see an [`AudioContextHandle`], a read-only view.
//! Lifecycle calls (`resume`, `suspend`, `close`, module loading) are reserved
//! to the owning [`ContextSource`](crate::ContextSource).

pub mod sim;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::gate::UserActivation;

// ── Value types ────────────────────────────────────────────────────────────

/// Lifecycle state reported by a platform context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Initializing,
    Running,
    Suspended,
    Closed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What a context source's contexts are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPurpose {
    Playback,
    Recording,
}

impl ContextPurpose {
    pub const ALL: [Self; 2] = [Self::Playback, Self::Recording];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Playback => "playback",
            Self::Recording => "recording",
        }
    }
}

impl fmt::Display for ContextPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output latency class requested at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyHint {
    Interactive,
    #[default]
    Balanced,
    Playback,
}

/// Parameters passed to [`AudioPlatform::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    pub purpose: ContextPurpose,
    pub sample_rate: u32,
    pub latency_hint: LatencyHint,
}

/// How a `resume` call was initiated.
///
/// `Gesture` carries the proof handed to interaction handlers by the
/// [`InteractionGate`](crate::InteractionGate). The proof borrows the gesture
/// dispatch, so a resume can only claim gesture authority while that dispatch
/// is still on the stack.
#[derive(Debug, Clone, Copy)]
pub enum Activation<'a> {
    Autonomous,
    Gesture(&'a UserActivation<'a>),
}

impl Activation<'_> {
    pub const fn is_gesture(&self) -> bool {
        matches!(self, Self::Gesture(_))
    }
}

/// Future returned by platform lifecycle calls.
///
/// The future is `'static`: any work that has to happen synchronously (for
/// example inside a gesture dispatch) is done before it is returned.
pub type PlatformFuture = BoxFuture<'static, Result<(), PlatformError>>;

// ── Ports ──────────────────────────────────────────────────────────────────

/// A live platform audio context.
pub trait PlatformContext: Send + Sync + fmt::Debug {
    /// Current lifecycle state.
    fn state(&self) -> ContextState;

    /// Render clock, in seconds since construction.
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Schedule a short silent buffer to nudge the render clock.
    ///
    /// Returns `false` when the context can't accept one right now.
    fn ping(&self) -> bool;

    fn as_any(&self) -> &dyn Any;

    /// Load a named processing module into the context.
    fn load_module(&self, name: &str) -> PlatformFuture;

    fn resume(&self, activation: Activation<'_>) -> PlatformFuture;

    fn suspend(&self) -> PlatformFuture;

    fn close(&self) -> PlatformFuture;
}

/// Factory for platform audio contexts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioPlatform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether the platform lets contexts resume without a user gesture.
    fn is_always_interactive(&self) -> bool;

    /// Construct a new context. It may start in any state.
    async fn create(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn PlatformContext>, PlatformError>;
}

// ── Handle ─────────────────────────────────────────────────────────────────

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a context created by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

struct HandleInner {
    id: ContextId,
    purpose: ContextPurpose,
    created_at: DateTime<Utc>,
    context: Arc<dyn PlatformContext>,
    broken: AtomicBool,
}

/// Shared, read-only view of a context owned by a [`ContextSource`](crate::ContextSource).
///
/// Cheap to clone. Two handles are equal when they refer to the same context.
#[derive(Clone)]
pub struct AudioContextHandle {
    inner: Arc<HandleInner>,
}

impl AudioContextHandle {
    pub(crate) fn new(purpose: ContextPurpose, context: Arc<dyn PlatformContext>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: ContextId::next(),
                purpose,
                created_at: Utc::now(),
                context,
                broken: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn purpose(&self) -> ContextPurpose {
        self.inner.purpose
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn state(&self) -> ContextState {
        self.inner.context.state()
    }

    pub fn current_time(&self) -> f64 {
        self.inner.context.current_time()
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.context.sample_rate()
    }

    /// Access the concrete platform context, e.g. to build an audio graph.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.context.as_any().downcast_ref::<T>()
    }

    // Lifecycle, reserved to the owning source.

    pub(crate) fn ping(&self) -> bool {
        self.inner.context.ping()
    }

    pub(crate) fn load_module(&self, name: &str) -> PlatformFuture {
        self.inner.context.load_module(name)
    }

    pub(crate) fn resume(&self, activation: Activation<'_>) -> PlatformFuture {
        self.inner.context.resume(activation)
    }

    pub(crate) fn suspend(&self) -> PlatformFuture {
        self.inner.context.suspend()
    }

    pub(crate) fn close(&self) -> PlatformFuture {
        self.inner.context.close()
    }

    pub(crate) fn mark_broken(&self) {
        self.inner.broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::SeqCst)
    }
}

impl PartialEq for AudioContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for AudioContextHandle {}

impl fmt::Debug for AudioContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioContextHandle")
            .field("id", &self.inner.id)
            .field("purpose", &self.inner.purpose)
            .field("state", &self.state())
            .field("broken", &self.is_broken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimulatedPlatform;

    #[tokio::test(start_paused = true)]
    async fn handles_compare_by_identity() {
        let platform = SimulatedPlatform::always_interactive();
        let options = ContextOptions {
            purpose: ContextPurpose::Playback,
            sample_rate: 48_000,
            latency_hint: LatencyHint::Balanced,
        };
        let a = AudioContextHandle::new(
            ContextPurpose::Playback,
            platform.create(&options).await.unwrap(),
        );
        let b = AudioContextHandle::new(
            ContextPurpose::Playback,
            platform.create(&options).await.unwrap(),
        );

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.id() < b.id());
        assert_eq!(a.sample_rate(), 48_000);
        assert!(a.downcast_ref::<sim::SimulatedContext>().is_some());
    }

    #[test]
    fn purpose_and_state_display() {
        assert_eq!(ContextPurpose::Recording.to_string(), "recording");
        assert_eq!(ContextState::Suspended.to_string(), "suspended");
        assert_eq!(
            serde_json::to_string(&ContextState::Running).unwrap(),
            "\"running\""
        );
    }

    #[tokio::test]
    async fn mocked_platform_reports_creation_failure() {
        let mut platform = MockAudioPlatform::new();
        platform.expect_name().return_const("mock");
        platform
            .expect_create()
            .returning(|_| Err(PlatformError::Create("no device".into())));

        let options = ContextOptions {
            purpose: ContextPurpose::Recording,
            sample_rate: 16_000,
            latency_hint: LatencyHint::Interactive,
        };
        let err = platform.create(&options).await.unwrap_err();
        assert_eq!(platform.name(), "mock");
        assert_eq!(err, PlatformError::Create("no device".into()));
    }
}
