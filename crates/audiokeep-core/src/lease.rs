//! Context leases: one consumer's claim on a source's current context.
//!
//! A lease never owns the context. It waits for readiness, brackets the
//! consumer's work with an in-use flag the maintenance loop respects, and
//! delivers an ordered stream of [`ContextChange`]s so long-lived consumers
//! (a playback graph, a recorder) can rebuild against a replacement context.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;
use crate::platform::AudioContextHandle;
use crate::source::SourceInner;

/// Source-unique identifier of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub(crate) u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// A change in what a lease may use.
///
/// The first change seen by a lease is always `NotReady`. After that `Ready`
/// and `NotReady` strictly alternate, and `Disposed` ends the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextChange {
    NotReady,
    Ready(AudioContextHandle),
    Disposed,
}

impl ContextChange {
    /// The newly valid handle, if any.
    pub const fn handle(&self) -> Option<&AudioContextHandle> {
        match self {
            Self::Ready(handle) => Some(handle),
            Self::NotReady | Self::Disposed => None,
        }
    }
}

/// Lifecycle callbacks for consumers that keep state bound to a context.
///
/// `on_attach`/`on_detach` are awaited by the maintenance loop whenever the
/// live context changes, so a consumer finishes rebuilding before the loop
/// moves on. `on_dispose` runs once when the lease (or its source) is
/// disposed.
#[async_trait]
pub trait LeaseObserver: Send + Sync {
    async fn on_attach(&self, _handle: &AudioContextHandle) {}

    async fn on_detach(&self, _handle: &AudioContextHandle) {}

    async fn on_dispose(&self) {}
}

/// Lease state shared with the owning source.
pub(crate) struct LeaseShared {
    pub(crate) id: LeaseId,
    pub(crate) operation: String,
    busy: AtomicBool,
    in_use: AtomicBool,
    waiting: AtomicBool,
    disposed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    changes: mpsc::UnboundedSender<ContextChange>,
    observer: Option<Arc<dyn LeaseObserver>>,
    attached: Mutex<Option<AudioContextHandle>>,
}

impl LeaseShared {
    pub(crate) fn new(
        id: LeaseId,
        operation: String,
        cancel: CancellationToken,
        observer: Option<Arc<dyn LeaseObserver>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ContextChange>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            operation,
            busy: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel,
            changes,
            observer,
            attached: Mutex::new(None),
        });
        (shared, rx)
    }

    /// Deliver a change. Callers hold the source registry lock, which is
    /// what orders deliveries across leases.
    pub(crate) fn push(&self, change: ContextChange) {
        let _ = self.changes.send(change);
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_use(&self, value: bool) {
        self.in_use.store(value, Ordering::SeqCst);
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Flip to disposed. Returns `false` if already disposed.
    pub(crate) fn begin_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    pub(crate) const fn has_observer(&self) -> bool {
        self.observer.is_some()
    }

    /// Bring the observer's attached context in line with `target`.
    pub(crate) async fn sync_observer(&self, target: Option<&AudioContextHandle>) {
        let Some(observer) = &self.observer else {
            return;
        };
        let mut attached = self.attached.lock().await;
        if self.is_disposed() || attached.as_ref() == target {
            return;
        }
        if let Some(previous) = attached.take() {
            tracing::debug!(lease_id = %self.id, context_id = %previous.id(), "Detaching lease observer");
            observer.on_detach(&previous).await;
        }
        if let Some(next) = target {
            tracing::debug!(lease_id = %self.id, context_id = %next.id(), "Attaching lease observer");
            observer.on_attach(next).await;
            *attached = Some(next.clone());
        }
    }

    /// Final detach followed by `on_dispose`.
    pub(crate) async fn finish_observer(&self) {
        let Some(observer) = &self.observer else {
            return;
        };
        let previous = self.attached.lock().await.take();
        if let Some(previous) = previous {
            observer.on_detach(&previous).await;
        }
        observer.on_dispose().await;
    }
}

impl fmt::Debug for LeaseShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseShared")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("in_use", &self.is_in_use())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// ── Guards ─────────────────────────────────────────────────────────────────

/// Clears the outstanding-use flag.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Marks a lease as waiting for readiness, which counts as demand.
struct WaitingGuard<'a> {
    lease: &'a LeaseShared,
    source: &'a SourceInner,
}

impl<'a> WaitingGuard<'a> {
    fn new(lease: &'a LeaseShared, source: &'a SourceInner) -> Self {
        lease.waiting.store(true, Ordering::SeqCst);
        source.bump_activity();
        Self { lease, source }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.lease.waiting.store(false, Ordering::SeqCst);
        self.source.bump_activity();
    }
}

/// Clears `in_use` however the wrapped work settles.
struct InUseGuard<'a> {
    lease: &'a LeaseShared,
    source: &'a SourceInner,
}

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        self.lease.set_in_use(false);
        self.source.bump_activity();
        tracing::trace!(lease_id = %self.lease.id, "Lease released context");
    }
}

// ── Lease ──────────────────────────────────────────────────────────────────

/// A consumer's claim on a [`ContextSource`](crate::ContextSource)'s context.
///
/// Created by [`ContextSource::acquire`](crate::ContextSource::acquire).
/// Dropping a lease disposes it; call [`dispose`](Self::dispose) to also
/// await the observer callbacks.
pub struct ContextLease {
    shared: Arc<LeaseShared>,
    source: Arc<SourceInner>,
    changes: mpsc::UnboundedReceiver<ContextChange>,
    /// `Disposed` has been handed out.
    ended: bool,
}

impl ContextLease {
    pub(crate) const fn new(
        shared: Arc<LeaseShared>,
        source: Arc<SourceInner>,
        changes: mpsc::UnboundedReceiver<ContextChange>,
    ) -> Self {
        Self {
            shared,
            source,
            changes,
            ended: false,
        }
    }

    pub fn id(&self) -> LeaseId {
        self.shared.id
    }

    /// Diagnostic label given at acquisition.
    pub fn operation_name(&self) -> &str {
        &self.shared.operation
    }

    /// Whether a [`use_context`](Self::use_context) call is running its work.
    pub fn is_in_use(&self) -> bool {
        self.shared.is_in_use()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Resolve once the source holds a healthy context.
    ///
    /// Call again after a change notification to get the replacement.
    pub async fn when_ready(&self) -> Result<AudioContextHandle, ContextError> {
        if self.is_disposed() {
            return Err(ContextError::Disposed);
        }
        self.source
            .when_ready(&self.shared.cancel)
            .await
            .map_err(|_| ContextError::Disposed)
    }

    /// Run `work` against the current healthy context.
    ///
    /// The lease counts as in use for exactly as long as `work` runs, so
    /// the source won't close the context underneath it. `in_use` is cleared
    /// however `work` settles, including when this future is dropped. Work
    /// still running when the lease or source is disposed is cancelled.
    pub async fn use_context<F, Fut, R>(&self, work: F) -> Result<R, ContextError>
    where
        F: FnOnce(AudioContextHandle) -> Fut,
        Fut: Future<Output = R>,
    {
        if self.is_disposed() {
            return Err(ContextError::Disposed);
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ContextError::AlreadyInUse(self.shared.operation.clone()));
        }
        let _busy = BusyGuard(&self.shared.busy);

        let handle = loop {
            let candidate = {
                let _waiting = WaitingGuard::new(&self.shared, &self.source);
                self.source
                    .when_ready(&self.shared.cancel)
                    .await
                    .map_err(|_| ContextError::Disposed)?
            };
            // The context may have been withdrawn between readiness and now.
            if self.source.begin_use(&self.shared, &candidate) {
                break candidate;
            }
        };
        let _in_use = InUseGuard {
            lease: &self.shared,
            source: &self.source,
        };
        tracing::trace!(
            lease_id = %self.shared.id,
            operation = %self.shared.operation,
            context_id = %handle.id(),
            "Lease using context"
        );

        tokio::select! {
            biased;
            () = self.shared.cancel.cancelled() => Err(ContextError::Disposed),
            result = work(handle) => Ok(result),
        }
    }

    /// Wait for the next change notification. `None` after `Disposed` has
    /// been delivered.
    pub async fn next_change(&mut self) -> Option<ContextChange> {
        if self.ended {
            return None;
        }
        let change = self.changes.recv().await;
        self.note_end(change.as_ref());
        change
    }

    /// Take a pending change notification without waiting.
    pub fn try_next_change(&mut self) -> Option<ContextChange> {
        if self.ended {
            return None;
        }
        let change = self.changes.try_recv().ok();
        self.note_end(change.as_ref());
        change
    }

    fn note_end(&mut self, change: Option<&ContextChange>) {
        if matches!(change, Some(ContextChange::Disposed)) {
            self.ended = true;
        }
    }

    /// Permanently deactivate the lease. Idempotent.
    ///
    /// Cancels outstanding work, delivers a final `Disposed` change, removes
    /// the lease from its source and runs the observer's detach and dispose
    /// callbacks.
    pub async fn dispose(&self) {
        if !self.release() {
            return;
        }
        self.shared.finish_observer().await;
    }

    /// Synchronous part of disposal. Returns `false` if already disposed.
    fn release(&self) -> bool {
        if !self.shared.begin_dispose() {
            return false;
        }
        self.shared.cancel.cancel();
        self.source.unregister(&self.shared);
        tracing::debug!(
            lease_id = %self.shared.id,
            operation = %self.shared.operation,
            "Lease disposed"
        );
        true
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if !self.release() || !self.shared.has_observer() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move { shared.finish_observer().await });
        }
    }
}

impl fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLease")
            .field("id", &self.shared.id)
            .field("operation", &self.shared.operation)
            .field("in_use", &self.is_in_use())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
