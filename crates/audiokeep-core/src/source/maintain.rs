//! The maintenance loop.
//!
//! One task per source. Each iteration of the outer loop is an episode:
//! create a context, supervise it until it is lost, retire it. How it was
//! lost decides what happens before the next episode.
//!
//! Every wait inside an episode goes through [`Maintainer::guarded`], which
//! unwinds it on stop (dispose), on a reset or on a device wake.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::health::TestKind;
use super::{BackgroundState, MaintainState, SourceInner};
use crate::error::{MaintainError, PlatformError};
use crate::events::SourceEventKind;
use crate::platform::{AudioContextHandle, ContextOptions, ContextState};

/// Consecutive failed episodes tolerated before waiting for permission.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub(super) struct Maintainer {
    pub(super) source: Arc<SourceInner>,
    run: CancellationToken,
    wakes: watch::Receiver<u64>,
    restarts: watch::Receiver<u64>,
    /// Last reset this loop has started over for.
    epoch: u64,
}

impl Maintainer {
    pub(super) fn new(source: Arc<SourceInner>, run: CancellationToken) -> Self {
        let wakes = source.wakes.subscribe();
        let mut restarts = source.restarts.subscribe();
        let epoch = *restarts.borrow_and_update();
        Self {
            source,
            run,
            wakes,
            restarts,
            epoch,
        }
    }

    // ── Waiting ────────────────────────────────────────────────────────────

    /// Run `fut` unless the loop is stopped, reset or the device wakes first.
    pub(super) async fn guarded<T, F>(&self, fut: F) -> Result<T, MaintainError>
    where
        F: Future<Output = Result<T, MaintainError>>,
    {
        let mut wakes = self.wakes.clone();
        let mut restarts = self.restarts.clone();
        tokio::select! {
            biased;
            () = self.run.cancelled() => Err(MaintainError::Stopped),
            Ok(()) = restarts.changed() => Err(MaintainError::Restarted),
            Ok(()) = wakes.changed() => Err(MaintainError::DeviceWake),
            result = fut => result,
        }
    }

    pub(super) async fn pause(&self, duration: Duration) -> Result<(), MaintainError> {
        self.guarded(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Mark the pending wake as handled.
    fn acknowledge_wake(&mut self) {
        self.wakes.borrow_and_update();
    }

    fn acknowledge_restart(&mut self) {
        self.epoch = *self.restarts.borrow_and_update();
    }

    // ── Outer loop ─────────────────────────────────────────────────────────

    pub(super) async fn run(mut self) {
        let purpose = self.source.purpose;
        tracing::debug!(%purpose, "Maintenance loop started");

        let mut failures = 0u32;
        let mut escalated = false;
        let mut outcome = self.pause(self.source.config.startup_delay()).await;

        loop {
            if let Err(e) = outcome {
                match e {
                    MaintainError::Stopped => break,
                    MaintainError::Restarted => {
                        self.acknowledge_restart();
                        failures = 0;
                        escalated = false;
                    }
                    MaintainError::DeviceWake => {
                        self.acknowledge_wake();
                        failures = 0;
                        escalated = false;
                    }
                    MaintainError::IdleClosed => failures = 0,
                    MaintainError::TooManyResumeAttempts {
                        resume_count,
                        interactive_resume_count,
                    } => {
                        tracing::warn!(
                            %purpose,
                            resume_count,
                            interactive_resume_count,
                            "Too many resume attempts, recreating audio context after next interaction"
                        );
                        self.source.events.emit(SourceEventKind::Escalated {
                            resume_count,
                            interactive_resume_count,
                        });
                        failures = 0;
                        escalated = true;
                    }
                    e => {
                        failures += 1;
                        tracing::warn!(%purpose, error = %e, failures, "Audio context maintenance failed");
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            failures = 0;
                            escalated = true;
                        } else if let Err(e) = self.pause(self.source.config.fix_cycle()).await {
                            outcome = Err(e);
                            continue;
                        }
                    }
                }
            }

            if escalated {
                if let Err(e) = self.await_recreate_permission().await {
                    outcome = Err(e);
                    continue;
                }
                escalated = false;
            }

            if let Err(e) = self.await_demand().await {
                outcome = Err(e);
                continue;
            }

            outcome = Err(self.episode().await);
        }

        self.source.set_state(MaintainState::NoHandle);
        tracing::debug!(%purpose, "Maintenance loop stopped");
    }

    /// After escalation: wait for a gesture (or for the host to leave
    /// `BackgroundIdle`) before building another context. Hosts that never
    /// deliver gestures back off instead.
    async fn await_recreate_permission(&self) -> Result<(), MaintainError> {
        self.source.set_state(MaintainState::NoHandle);
        let source = &self.source;
        if source.gate.is_always_interactive() {
            return self.pause(source.config.escalation_backoff()).await;
        }

        tracing::info!(
            purpose = %source.purpose,
            "Waiting for user interaction before recreating audio context"
        );
        let mut background = source.background.subscribe();
        let was_idle = *background.borrow_and_update() == BackgroundState::BackgroundIdle;
        self.guarded(async {
            tokio::select! {
                () = source.gate.wait_for_next_interaction() => {}
                () = left_idle(&mut background), if was_idle => {}
            }
            Ok(())
        })
        .await
    }

    /// Hold off while idle in the background with nobody waiting.
    async fn await_demand(&self) -> Result<(), MaintainError> {
        let source = &self.source;
        let mut background = source.background.subscribe();
        let mut activity = source.activity.subscribe();
        loop {
            background.borrow_and_update();
            activity.borrow_and_update();
            if source.background() != BackgroundState::BackgroundIdle
                || source.has_waiting_leases()
            {
                return Ok(());
            }
            self.source.set_state(MaintainState::NoHandle);
            self.guarded(async {
                tokio::select! {
                    _ = background.changed() => {}
                    _ = activity.changed() => {}
                }
                Ok(())
            })
            .await?;
        }
    }

    // ── Episode ────────────────────────────────────────────────────────────

    /// Create, supervise and retire one context. Returns why it ended.
    async fn episode(&self) -> MaintainError {
        let handle = match self.create().await {
            Ok(handle) => handle,
            Err(e) => return e,
        };
        let reason = self.supervise(&handle).await;
        tracing::debug!(
            purpose = %self.source.purpose,
            context_id = %handle.id(),
            reason = %reason,
            "Audio context episode ended"
        );
        self.retire(&handle).await;
        reason
    }

    async fn create(&self) -> Result<AudioContextHandle, MaintainError> {
        let source = &self.source;
        source.set_state(MaintainState::Creating);
        source.reset_counters();

        let options = ContextOptions {
            purpose: source.purpose,
            sample_rate: source.purpose_config.sample_rate,
            latency_hint: source.purpose_config.latency_hint,
        };
        let timeout = source.config.create_timeout();
        let context = self
            .guarded(async {
                tokio::time::timeout(timeout, source.platform.create(&options))
                    .await
                    .map_err(|_| {
                        MaintainError::CreationFailure(PlatformError::Create(format!(
                            "timed out after {timeout:?}"
                        )))
                    })?
                    .map_err(MaintainError::CreationFailure)
            })
            .await?;

        let handle = AudioContextHandle::new(source.purpose, context);
        *source.live() = Some(handle.clone());

        let modules = &source.purpose_config.modules;
        let loaded = self
            .guarded(async {
                join_all(modules.iter().map(|name| handle.load_module(name)))
                    .await
                    .into_iter()
                    .collect::<Result<Vec<()>, _>>()
                    .map(|_| ())
                    .map_err(MaintainError::CreationFailure)
            })
            .await;
        if let Err(e) = loaded {
            self.discard(&handle).await;
            return Err(e);
        }

        tracing::info!(
            purpose = %source.purpose,
            context_id = %handle.id(),
            platform = source.platform.name(),
            state = %handle.state(),
            modules = modules.len(),
            "Audio context created"
        );
        source.events.emit(SourceEventKind::ContextCreated {
            context_id: handle.id(),
        });
        Ok(handle)
    }

    /// Activate, test, then keep the context healthy until it is lost.
    async fn supervise(&self, handle: &AudioContextHandle) -> MaintainError {
        let source = &self.source;
        source.set_state(MaintainState::Testing);

        let first = self
            .guarded(async {
                self.activate(handle).await?;
                self.test(handle, TestKind::Short).await
            })
            .await;
        match first {
            Ok(()) => self.on_healthy(handle).await,
            Err(e) if e.is_interrupt() => return e,
            Err(e) => {
                tracing::debug!(
                    purpose = %source.purpose,
                    context_id = %handle.id(),
                    error = %e,
                    "Audio context activation failed"
                );
                if let Err(e) = self.repair(handle).await {
                    return e;
                }
            }
        }

        let mut activity = source.activity.subscribe();
        let mut background = source.background.subscribe();
        let cycle = source.config.maintain_cycle();
        let mut last_test = Instant::now();

        loop {
            activity.borrow_and_update();
            background.borrow_and_update();
            source.sync_observers(Some(handle)).await;

            if source.background() == BackgroundState::BackgroundIdle
                && (source.idle_armed.load(Ordering::SeqCst)
                    || !source.has_leases_in_use())
            {
                if let Err(e) = self.idle_down(handle).await {
                    return e;
                }
                last_test = Instant::now();
                continue;
            }

            if !source.has_leases_in_use() {
                // Nobody is using the context: don't test, just wait for
                // demand, a visibility change or the next cycle.
                let waited = self
                    .guarded(async {
                        tokio::select! {
                            _ = activity.changed() => {}
                            _ = background.changed() => {}
                            () = tokio::time::sleep(cycle) => {}
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = waited {
                    return e;
                }
                continue;
            }

            let due = last_test + cycle;
            if Instant::now() < due {
                let waited = self
                    .guarded(async {
                        tokio::select! {
                            _ = background.changed() => {}
                            () = tokio::time::sleep_until(due) => {}
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = waited {
                    return e;
                }
                continue;
            }

            last_test = Instant::now();
            match self
                .guarded(self.test(handle, TestKind::Long))
                .await
            {
                Ok(()) => self.on_healthy(handle).await,
                Err(e) if e.is_interrupt() => return e,
                Err(e) => {
                    tracing::warn!(
                        purpose = %source.purpose,
                        context_id = %handle.id(),
                        error = %e,
                        "Audio context health test failed"
                    );
                    source.events.emit(SourceEventKind::HealthTestFailed {
                        context_id: handle.id(),
                        reason: e.to_string(),
                    });
                    if let Err(e) = self.repair(handle).await {
                        return e;
                    }
                    last_test = Instant::now();
                }
            }
        }
    }

    /// Counters reset, readiness announced, observers attached.
    pub(super) async fn on_healthy(&self, handle: &AudioContextHandle) {
        let source = &self.source;
        source.reset_counters();
        source.set_state(MaintainState::Healthy);
        source.mark_ready(handle, self.epoch);
        source.sync_observers(Some(handle)).await;
    }

    /// Suspend and eventually close the context while idle in the
    /// background. `Ok` means it is healthy and in use again.
    async fn idle_down(&self, handle: &AudioContextHandle) -> Result<(), MaintainError> {
        let source = &self.source;
        source
            .idle_armed
            .store(false, Ordering::SeqCst);
        let mut background = source.background.subscribe();
        let mut activity = source.activity.subscribe();

        let debounced = self
            .guarded(async {
                tokio::select! {
                    () = left_idle(&mut background) => Ok(false),
                    () = tokio::time::sleep(source.config.suspend_debounce()) => Ok(true),
                }
            })
            .await?;
        if !debounced {
            return Ok(());
        }

        tracing::info!(
            purpose = %source.purpose,
            context_id = %handle.id(),
            "Suspending audio context while idle in background"
        );
        source.mark_not_ready();
        if self.guarded(async { Ok(self.try_suspend(handle).await) }).await? {
            source.events.emit(SourceEventKind::Suspended {
                context_id: handle.id(),
            });
        }

        loop {
            background.borrow_and_update();
            activity.borrow_and_update();

            if source.background() != BackgroundState::BackgroundIdle
                || source.has_waiting_leases()
            {
                return self.wake_from_idle(handle).await;
            }

            if source.has_leases_in_use() {
                self.guarded(async {
                    tokio::select! {
                        _ = background.changed() => {}
                        _ = activity.changed() => {}
                    }
                    Ok(())
                })
                .await?;
                continue;
            }

            let expired = self
                .guarded(async {
                    tokio::select! {
                        _ = background.changed() => Ok(false),
                        _ = activity.changed() => Ok(false),
                        () = tokio::time::sleep(source.config.close_debounce()) => Ok(true),
                    }
                })
                .await?;
            if expired {
                tracing::info!(
                    purpose = %source.purpose,
                    context_id = %handle.id(),
                    "Closing audio context unused in background"
                );
                return Err(MaintainError::IdleClosed);
            }
        }
    }

    async fn wake_from_idle(&self, handle: &AudioContextHandle) -> Result<(), MaintainError> {
        tracing::debug!(
            purpose = %self.source.purpose,
            context_id = %handle.id(),
            "Waking audio context"
        );
        self.source.set_state(MaintainState::Testing);
        let woke = self
            .guarded(async {
                self.activate(handle).await?;
                self.test(handle, TestKind::Short).await
            })
            .await;
        match woke {
            Ok(()) => {
                self.on_healthy(handle).await;
                Ok(())
            }
            Err(e) if e.is_interrupt() => Err(e),
            Err(_) => self.repair(handle).await,
        }
    }

    /// Suspend/resume/test until healthy, or give up.
    async fn repair(&self, handle: &AudioContextHandle) -> Result<(), MaintainError> {
        let source = &self.source;
        source.set_state(MaintainState::Broken);
        source.mark_not_ready();
        source.set_state(MaintainState::Fixing);

        loop {
            if handle.state() == ContextState::Closed {
                return Err(MaintainError::ContextClosed);
            }
            let (resume_count, interactive_resume_count) = source.counters();
            if resume_count >= source.config.max_resume_count
                || interactive_resume_count >= source.config.max_interactive_resume_count
            {
                return Err(MaintainError::TooManyResumeAttempts {
                    resume_count,
                    interactive_resume_count,
                });
            }

            match self.guarded(self.fix(handle)).await {
                Ok(()) => {
                    tracing::info!(
                        purpose = %source.purpose,
                        context_id = %handle.id(),
                        resume_count,
                        "Audio context repaired"
                    );
                    self.on_healthy(handle).await;
                    return Ok(());
                }
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        purpose = %source.purpose,
                        context_id = %handle.id(),
                        error = %e,
                        resume_count,
                        interactive_resume_count,
                        "Audio context fix attempt failed"
                    );
                    self.pause(source.config.fix_cycle()).await?;
                }
            }
        }
    }

    /// Withdraw readiness, wait for in-flight uses, detach observers and
    /// close the context.
    async fn retire(&self, handle: &AudioContextHandle) {
        let source = &self.source;
        source.set_state(MaintainState::Closing);
        source.mark_not_ready();

        // No new use can start once readiness is withdrawn.
        let mut activity = source.activity.subscribe();
        while source.has_leases_in_use() {
            tracing::debug!(
                purpose = %source.purpose,
                context_id = %handle.id(),
                "Waiting for leases to release the audio context"
            );
            if activity.changed().await.is_err() {
                break;
            }
        }

        source.sync_observers(None).await;
        self.discard(handle).await;
        source.set_state(MaintainState::NoHandle);
    }

    /// Close a context and forget it.
    async fn discard(&self, handle: &AudioContextHandle) {
        let source = &self.source;
        let timeout = source.config.close_timeout();
        match tokio::time::timeout(timeout, handle.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(
                purpose = %source.purpose,
                context_id = %handle.id(),
                error = %e,
                "Audio context close failed"
            ),
            Err(_) => tracing::debug!(
                purpose = %source.purpose,
                context_id = %handle.id(),
                ?timeout,
                "Audio context close timed out"
            ),
        }

        {
            let mut live = source.live();
            if live.as_ref() == Some(handle) {
                *live = None;
            }
        }
        tracing::info!(
            purpose = %source.purpose,
            context_id = %handle.id(),
            "Audio context closed"
        );
        source.events.emit(SourceEventKind::ContextClosed {
            context_id: handle.id(),
        });
    }
}

/// Resolve once the watched state is something other than `BackgroundIdle`.
async fn left_idle(background: &mut watch::Receiver<BackgroundState>) {
    loop {
        if *background.borrow_and_update() != BackgroundState::BackgroundIdle {
            return;
        }
        if background.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
