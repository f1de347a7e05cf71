//! `Send + Sync` proxy for a context owned by an audio thread.

use std::any::Any;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use audiokeep_core::{Activation, ContextState, PlatformContext, PlatformError, PlatformFuture};
use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::clock::FrameClock;
use crate::thread::{ContextCommand, Reply};

/// A host audio context.
///
/// Every lifecycle call is routed to the context's audio thread; state and
/// clock reads are served from shared memory without a round trip.
pub struct HostContext {
    label: String,
    clock: Arc<FrameClock>,
    state: Arc<Mutex<ContextState>>,
    commands: mpsc::Sender<ContextCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HostContext {
    pub(crate) const fn new(
        label: String,
        clock: Arc<FrameClock>,
        state: Arc<Mutex<ContextState>>,
        commands: mpsc::Sender<ContextCommand>,
        thread: thread::JoinHandle<()>,
    ) -> Self {
        Self {
            label,
            clock,
            state,
            commands,
            thread: Some(thread),
        }
    }

    /// Name of the owning audio thread.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.clock.frames()
    }

    /// Processing modules installed in this context.
    pub async fn loaded_modules(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(ContextCommand::LoadedModules { reply: tx })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Send a request and await the thread's reply.
    fn request(&self, build: impl FnOnce(Reply) -> ContextCommand) -> PlatformFuture {
        if self.state() == ContextState::Closed {
            return async { Err(PlatformError::Closed) }.boxed();
        }
        let (tx, rx) = oneshot::channel();
        let state = Arc::clone(&self.state);
        if self.commands.send(build(tx)).is_err() {
            let err = gone(&state);
            return async move { Err(err) }.boxed();
        }
        // A command queued behind `Close` is dropped unanswered.
        async move { rx.await.unwrap_or_else(|_| Err(gone(&state))) }.boxed()
    }
}

fn gone(state: &Mutex<ContextState>) -> PlatformError {
    if *state.lock().unwrap_or_else(PoisonError::into_inner) == ContextState::Closed {
        PlatformError::Closed
    } else {
        PlatformError::OwnerGone
    }
}

impl PlatformContext for HostContext {
    fn state(&self) -> ContextState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_time(&self) -> f64 {
        self.clock.seconds()
    }

    fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    fn ping(&self) -> bool {
        self.state() == ContextState::Running && self.commands.send(ContextCommand::Ping).is_ok()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn load_module(&self, name: &str) -> PlatformFuture {
        let name = name.to_string();
        self.request(|reply| ContextCommand::LoadModule { name, reply })
    }

    // Native hosts never need a gesture.
    fn resume(&self, _activation: Activation<'_>) -> PlatformFuture {
        self.request(|reply| ContextCommand::Resume { reply })
    }

    fn suspend(&self) -> PlatformFuture {
        self.request(|reply| ContextCommand::Suspend { reply })
    }

    fn close(&self) -> PlatformFuture {
        self.request(|reply| ContextCommand::Close { reply })
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("frames", &self.clock.frames())
            .finish_non_exhaustive()
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        // Best-effort shutdown; the thread may already be gone.
        let _ = self.commands.send(ContextCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
