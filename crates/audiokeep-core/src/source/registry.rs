//! Readiness and lease bookkeeping.
//!
//! Readiness flips and lease registration happen under one lock, so every
//! lease sees the same ordered sequence of changes: a new lease gets
//! `NotReady` (plus `Ready` if a context is live) at registration, and from
//! then on exactly one notification per flip.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ContextError;
use crate::lease::{ContextChange, LeaseId, LeaseShared};
use crate::platform::AudioContextHandle;

/// Value published on the readiness channel.
#[derive(Debug, Clone)]
pub(crate) enum Readiness {
    NotReady,
    Ready(AudioContextHandle),
    Disposed,
}

#[derive(Debug, Default)]
pub(super) struct Registry {
    ready: Option<AudioContextHandle>,
    leases: BTreeMap<LeaseId, Arc<LeaseShared>>,
    per_operation: BTreeMap<String, usize>,
    /// Leases released by `dispose`; their cancelled uses may still be
    /// unwinding.
    retired: Vec<Arc<LeaseShared>>,
    disposed: bool,
}

impl Registry {
    pub(super) fn readiness(&self) -> Readiness {
        if self.disposed {
            return Readiness::Disposed;
        }
        self.ready
            .as_ref()
            .map_or(Readiness::NotReady, |handle| Readiness::Ready(handle.clone()))
    }

    pub(super) const fn current(&self) -> Option<&AudioContextHandle> {
        self.ready.as_ref()
    }

    pub(super) const fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Announce `handle` as ready. No-op when already ready.
    pub(super) fn mark_ready(&mut self, handle: &AudioContextHandle) -> bool {
        if self.disposed || self.ready.is_some() {
            return false;
        }
        self.ready = Some(handle.clone());
        for lease in self.leases.values() {
            lease.push(ContextChange::Ready(handle.clone()));
        }
        true
    }

    /// Withdraw readiness. No-op when not ready.
    pub(super) fn mark_not_ready(&mut self) -> bool {
        if self.disposed || self.ready.take().is_none() {
            return false;
        }
        for lease in self.leases.values() {
            lease.push(ContextChange::NotReady);
        }
        true
    }

    /// Add a lease and deliver its initial changes. Returns the new total
    /// and the count for the lease's operation.
    pub(super) fn register(&mut self, lease: Arc<LeaseShared>) -> Result<(usize, usize), ContextError> {
        if self.disposed {
            return Err(ContextError::Disposed);
        }
        lease.push(ContextChange::NotReady);
        if let Some(handle) = &self.ready {
            lease.push(ContextChange::Ready(handle.clone()));
        }

        let per_operation = self
            .per_operation
            .entry(lease.operation.clone())
            .or_default();
        *per_operation += 1;
        let per_operation = *per_operation;

        self.leases.insert(lease.id, lease);
        Ok((self.leases.len(), per_operation))
    }

    /// Remove a lease and deliver its final `Disposed`.
    pub(super) fn unregister(&mut self, lease: &LeaseShared) -> bool {
        let Some(removed) = self.leases.remove(&lease.id) else {
            return false;
        };
        if let Some(count) = self.per_operation.get_mut(&removed.operation) {
            *count -= 1;
            if *count == 0 {
                self.per_operation.remove(&removed.operation);
            }
        }
        removed.push(ContextChange::Disposed);
        true
    }

    /// Mark `lease` in use if `handle` is still the ready context.
    pub(super) fn begin_use(&self, lease: &LeaseShared, handle: &AudioContextHandle) -> bool {
        if lease.is_disposed() || self.ready.as_ref() != Some(handle) {
            return false;
        }
        lease.set_in_use(true);
        true
    }

    /// Close the registry for good and hand back the leases it held.
    pub(super) fn dispose(&mut self) -> Vec<Arc<LeaseShared>> {
        if self.disposed {
            return Vec::new();
        }
        self.disposed = true;
        self.ready = None;
        self.per_operation.clear();
        let leases: Vec<_> = std::mem::take(&mut self.leases).into_values().collect();
        for lease in &leases {
            lease.push(ContextChange::Disposed);
        }
        self.retired.clone_from(&leases);
        leases
    }

    fn tracked(&self) -> impl Iterator<Item = &Arc<LeaseShared>> {
        self.leases.values().chain(&self.retired)
    }

    pub(super) fn len(&self) -> usize {
        self.leases.len()
    }

    pub(super) fn in_use_count(&self) -> usize {
        self.tracked().filter(|lease| lease.is_in_use()).count()
    }

    pub(super) fn any_in_use(&self) -> bool {
        self.tracked().any(|lease| lease.is_in_use())
    }

    pub(super) fn any_waiting(&self) -> bool {
        self.leases.values().any(|lease| lease.is_waiting())
    }

    pub(super) fn per_operation(&self) -> BTreeMap<String, usize> {
        self.per_operation.clone()
    }

    /// Leases whose observers the maintenance loop has to keep in sync.
    pub(super) fn observed(&self) -> Vec<Arc<LeaseShared>> {
        self.leases
            .values()
            .filter(|lease| lease.has_observer())
            .cloned()
            .collect()
    }
}
