//! Health test and repair steps.
//!
//! None of these are guarded; callers wrap them in [`Maintainer::guarded`]
//! so they unwind on stop or device wake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use super::maintain::Maintainer;
use crate::error::{MaintainError, PlatformError};
use crate::events::SourceEventKind;
use crate::platform::{Activation, AudioContextHandle, ContextState, PlatformFuture};

/// Which sampling interval a health test uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TestKind {
    /// Right after activation or a fix.
    Short,
    /// Periodic supervision.
    Long,
}

/// Clears the awaiting-gesture flag however the wait ends.
struct AwaitingGesture<'a>(&'a AtomicBool);

impl<'a> AwaitingGesture<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for AwaitingGesture<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Maintainer {
    /// Get a freshly created (or woken) context running.
    pub(super) async fn activate(&self, handle: &AudioContextHandle) -> Result<(), MaintainError> {
        let gate = &self.source.gate;
        match handle.state() {
            // Some platforms hand out contexts that already run.
            ContextState::Running => {
                tracing::debug!(
                    purpose = %self.source.purpose,
                    context_id = %handle.id(),
                    "Audio context already running"
                );
                return Ok(());
            }
            ContextState::Closed => return Err(MaintainError::ContextClosed),
            ContextState::Initializing | ContextState::Suspended => {}
        }

        if gate.is_always_interactive() {
            return self.resume(handle, Activation::Autonomous).await;
        }
        if gate.is_interactive() {
            match self.resume(handle, Activation::Autonomous).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::debug!(
                    purpose = %self.source.purpose,
                    context_id = %handle.id(),
                    error = %e,
                    "Autonomous resume failed, waiting for user interaction"
                ),
            }
        }
        self.interactive_resume(handle).await
    }

    /// Suspend, resume (through a gesture where required) and test.
    pub(super) async fn fix(&self, handle: &AudioContextHandle) -> Result<(), MaintainError> {
        if !self.try_suspend(handle).await {
            return Err(MaintainError::SuspendFailure);
        }
        if self.source.gate.is_always_interactive() {
            self.resume(handle, Activation::Autonomous).await?;
        } else {
            self.interactive_resume(handle).await?;
        }
        self.test(handle, TestKind::Short).await
    }

    /// Resume without a gesture.
    async fn resume(
        &self,
        handle: &AudioContextHandle,
        activation: Activation<'_>,
    ) -> Result<(), MaintainError> {
        self.source.resume_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            purpose = %self.source.purpose,
            context_id = %handle.id(),
            "Resuming audio context"
        );
        let pending = handle.resume(activation);
        self.await_resume(handle, pending).await?;
        self.source.gate.note_autonomous_activation();
        Ok(())
    }

    /// Resume from inside the next user gesture.
    ///
    /// The resume call is issued by the gate's handler while the gesture is
    /// being dispatched; only the completion is awaited here.
    async fn interactive_resume(&self, handle: &AudioContextHandle) -> Result<(), MaintainError> {
        let source = &self.source;
        source.resume_count.fetch_add(1, Ordering::SeqCst);
        let attempt = source.interactive_resume_count.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = oneshot::channel::<PlatformFuture>();
        let slot = Mutex::new(Some(tx));
        let target = handle.clone();
        let registration = source.gate.on_interaction(move |activation| {
            let tx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(tx) = tx {
                let _ = tx.send(target.resume(Activation::Gesture(activation)));
            }
        });

        let pending = {
            let _awaiting = AwaitingGesture::set(&source.awaiting_gesture);
            tracing::debug!(
                purpose = %source.purpose,
                context_id = %handle.id(),
                attempt,
                "Waiting for user interaction to resume audio context"
            );
            source.events.emit(SourceEventKind::AwaitingGesture {
                context_id: handle.id(),
            });
            rx.await
                .map_err(|_| MaintainError::Platform(PlatformError::OwnerGone))?
        };
        drop(registration);

        tracing::debug!(
            purpose = %source.purpose,
            context_id = %handle.id(),
            attempt,
            "Resuming audio context from user interaction"
        );
        self.await_resume(handle, pending).await
    }

    async fn await_resume(
        &self,
        handle: &AudioContextHandle,
        pending: PlatformFuture,
    ) -> Result<(), MaintainError> {
        let limit = self.source.config.max_resume_time();
        match tokio::time::timeout(limit, pending).await {
            Err(_) => Err(MaintainError::ResumeTimeout(limit)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) if handle.state() == ContextState::Running => Ok(()),
            Ok(Ok(())) => Err(MaintainError::ResumeIneffective),
        }
    }

    /// Suspend unless already suspended. `false` if the context can't be
    /// brought to a suspended state.
    pub(super) async fn try_suspend(&self, handle: &AudioContextHandle) -> bool {
        match handle.state() {
            ContextState::Suspended => return true,
            ContextState::Closed => return false,
            ContextState::Initializing | ContextState::Running => {}
        }
        let limit = self.source.config.max_suspend_time();
        let outcome = match tokio::time::timeout(limit, handle.suspend()).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => MaintainError::from(e),
            Err(_) => MaintainError::SuspendTimeout(limit),
        };
        tracing::debug!(
            purpose = %self.source.purpose,
            context_id = %handle.id(),
            error = %outcome,
            "Audio context suspend failed"
        );
        false
    }

    /// Check that the context runs and its clock advances.
    ///
    /// Samples the render clock every interval for up to `test_cycle_count`
    /// intervals; while it stands still the context gets pinged to warm it
    /// up.
    pub(super) async fn test(
        &self,
        handle: &AudioContextHandle,
        kind: TestKind,
    ) -> Result<(), MaintainError> {
        let config = &self.source.config;
        check_state(handle)?;
        if config.trust_always_interactive && self.source.gate.is_always_interactive() {
            return Ok(());
        }

        let interval = match kind {
            TestKind::Short => config.short_test_interval(),
            TestKind::Long => config.long_test_interval(),
        };
        let start = handle.current_time();
        for cycle in 1..=config.test_cycle_count {
            tokio::time::sleep(interval).await;
            check_state(handle)?;
            let now = handle.current_time();
            if now > start {
                tracing::trace!(
                    purpose = %self.source.purpose,
                    context_id = %handle.id(),
                    cycle,
                    advanced = now - start,
                    "Audio context health test passed"
                );
                return Ok(());
            }
            let pinged = handle.ping();
            tracing::debug!(
                purpose = %self.source.purpose,
                context_id = %handle.id(),
                cycle,
                pinged,
                "Audio context clock is not advancing"
            );
        }

        Err(MaintainError::HealthTestFailure(format!(
            "clock did not advance in {} x {interval:?}",
            config.test_cycle_count
        )))
    }
}

fn check_state(handle: &AudioContextHandle) -> Result<(), MaintainError> {
    if handle.is_broken() {
        return Err(MaintainError::HealthTestFailure(
            "context is marked as broken".to_string(),
        ));
    }
    match handle.state() {
        ContextState::Running => Ok(()),
        ContextState::Closed => Err(MaintainError::ContextClosed),
        state => Err(MaintainError::HealthTestFailure(format!(
            "context is {state}"
        ))),
    }
}
