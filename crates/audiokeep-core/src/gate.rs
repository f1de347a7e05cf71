//! Interaction gate: brokers access to the next genuine user gesture.
//!
//! Gesture-gated platforms only allow a cold audio context to start from
//! inside the event handler of a real user gesture. The gate records whether
//! that permission currently holds and lets the maintenance loop run code
//! synchronously inside the next gesture dispatch.
//!
//! A device wake revokes the permission: platforms forget earlier gestures
//! once the device has been asleep, so a fresh one is needed even though
//! nothing the user did changed.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ContextError;

/// Qualifying user input events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionKind {
    Click,
    KeyDown,
    TouchEnd,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Click => "click",
            Self::KeyDown => "keydown",
            Self::TouchEnd => "touchend",
        };
        f.write_str(s)
    }
}

/// Proof that code is running inside a user gesture dispatch.
///
/// Only the gate constructs these, and only for the duration of
/// [`InteractionGate::report_interaction`]. Handlers receive a borrow, so the
/// proof can't be stashed and replayed after the dispatch returns.
#[derive(Debug)]
pub struct UserActivation<'a> {
    kind: InteractionKind,
    sequence: u64,
    _dispatch: PhantomData<&'a ()>,
}

impl UserActivation<'_> {
    const fn new(kind: InteractionKind, sequence: u64) -> Self {
        Self {
            kind,
            sequence,
            _dispatch: PhantomData,
        }
    }

    pub const fn kind(&self) -> InteractionKind {
        self.kind
    }

    /// Sequence number of the gesture, starting at 1.
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

type InteractionHandler = Arc<dyn Fn(&UserActivation<'_>) + Send + Sync>;

struct GateInner {
    is_interactive: AtomicBool,
    is_always_interactive: AtomicBool,
    handlers: Mutex<Vec<(u64, InteractionHandler)>>,
    next_handler_id: AtomicU64,
    gesture_count: AtomicU64,
    gestures: watch::Sender<u64>,
    wake_epoch: AtomicU64,
}

impl GateInner {
    fn handlers(&self) -> std::sync::MutexGuard<'_, Vec<(u64, InteractionHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide user interaction state.
///
/// Cloning shares the same state.
#[derive(Clone)]
pub struct InteractionGate {
    inner: Arc<GateInner>,
}

impl InteractionGate {
    /// Create a gate that requires gestures.
    pub fn new() -> Self {
        let (gestures, _) = watch::channel(0);
        Self {
            inner: Arc::new(GateInner {
                is_interactive: AtomicBool::new(false),
                is_always_interactive: AtomicBool::new(false),
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                gesture_count: AtomicU64::new(0),
                gestures,
                wake_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Create a gate for a host where gestures are implicit.
    pub fn always_interactive() -> Self {
        let gate = Self::new();
        gate.set_always_interactive(true);
        gate
    }

    /// Whether a gesture has been observed since the last device wake (or
    /// the host grants interaction implicitly).
    pub fn is_interactive(&self) -> bool {
        self.inner.is_interactive.load(Ordering::SeqCst)
    }

    pub fn is_always_interactive(&self) -> bool {
        self.inner.is_always_interactive.load(Ordering::SeqCst)
    }

    /// Set the platform capability flag. Enabling it also marks the gate
    /// interactive.
    pub fn set_always_interactive(&self, value: bool) {
        self.inner
            .is_always_interactive
            .store(value, Ordering::SeqCst);
        if value {
            self.inner.is_interactive.store(true, Ordering::SeqCst);
        }
        tracing::debug!(always_interactive = value, "Interaction gate capability set");
    }

    /// Mark the gate interactive from inside a gesture dispatch.
    pub fn mark_interactive(&self, activation: &UserActivation<'_>) {
        if !self.inner.is_interactive.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                kind = %activation.kind(),
                sequence = activation.sequence(),
                "Interaction gate: interactive"
            );
        }
    }

    /// Record that a context resumed without a gesture, which the platform
    /// only allows when interaction is already granted.
    pub(crate) fn note_autonomous_activation(&self) {
        if !self.inner.is_interactive.swap(true, Ordering::SeqCst) {
            tracing::debug!("Interaction gate: interactive (autonomous resume succeeded)");
        }
    }

    /// Entry point for the gesture source (DOM/input layer).
    ///
    /// Marks the gate interactive, runs every registered handler synchronously
    /// with a [`UserActivation`], then wakes all
    /// [`wait_for_next_interaction`](Self::wait_for_next_interaction) callers.
    pub fn report_interaction(&self, kind: InteractionKind) {
        let sequence = self.inner.gesture_count.fetch_add(1, Ordering::SeqCst) + 1;
        let activation = UserActivation::new(kind, sequence);
        self.mark_interactive(&activation);

        // Handlers may register or drop registrations themselves.
        let handlers: Vec<InteractionHandler> = self
            .inner
            .handlers()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        tracing::debug!(
            %kind,
            sequence,
            handlers = handlers.len(),
            "User interaction"
        );

        for handler in handlers {
            handler(&activation);
        }

        self.inner.gestures.send_replace(sequence);
    }

    /// Register a handler run synchronously inside every gesture dispatch.
    ///
    /// The handler is removed when the returned registration is dropped.
    pub fn on_interaction<F>(&self, handler: F) -> InteractionRegistration
    where
        F: Fn(&UserActivation<'_>) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers().push((id, Arc::new(handler)));
        InteractionRegistration {
            gate: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Resolve on the next gesture observed anywhere in the process.
    ///
    /// Never resolves if no gesture arrives; race it against a timeout (or
    /// use [`wait_for_next_interaction_within`](Self::wait_for_next_interaction_within)).
    pub async fn wait_for_next_interaction(&self) {
        let mut rx = self.inner.gestures.subscribe();
        rx.borrow_and_update();
        // The sender lives as long as `self`, so this can't observe a close.
        let _ = rx.changed().await;
    }

    pub async fn wait_for_next_interaction_within(
        &self,
        timeout: Duration,
    ) -> Result<(), ContextError> {
        tokio::time::timeout(timeout, self.wait_for_next_interaction())
            .await
            .map_err(|_| ContextError::InteractionTimeout(timeout))
    }

    /// Revoke interaction after the device woke from sleep.
    pub fn on_device_wake(&self) {
        let epoch = self.inner.wake_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.is_always_interactive() {
            tracing::debug!(epoch, "Device wake: always interactive, keeping interaction");
            return;
        }
        self.inner.is_interactive.store(false, Ordering::SeqCst);
        tracing::info!(epoch, "Device wake: interaction revoked until next gesture");
    }

    /// Number of device wakes observed so far.
    pub fn wake_epoch(&self) -> u64 {
        self.inner.wake_epoch.load(Ordering::SeqCst)
    }

    /// Number of gestures reported so far.
    pub fn interaction_count(&self) -> u64 {
        self.inner.gesture_count.load(Ordering::SeqCst)
    }

    /// Pending waiters plus registered handlers.
    pub fn waiter_count(&self) -> usize {
        self.inner.gestures.receiver_count() + self.inner.handlers().len()
    }
}

impl Default for InteractionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InteractionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractionGate")
            .field("is_interactive", &self.is_interactive())
            .field("is_always_interactive", &self.is_always_interactive())
            .field("wake_epoch", &self.wake_epoch())
            .finish_non_exhaustive()
    }
}

/// Keeps an interaction handler registered until dropped.
#[derive(Debug)]
#[must_use = "the handler is removed when the registration is dropped"]
pub struct InteractionRegistration {
    gate: Weak<GateInner>,
    id: u64,
}

impl Drop for InteractionRegistration {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.upgrade() {
            gate.handlers().retain(|(id, _)| *id != self.id);
        }
    }
}
