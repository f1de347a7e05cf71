//! Dedicated audio thread, one per context.
//!
//! The thread owns the context's [`Output`] for its entire lifetime and is
//! driven through [`ContextCommand`]s. Replies travel over tokio oneshot
//! channels so the async side can await them without blocking the runtime.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use audiokeep_core::{ContextState, PlatformError};
use tokio::sync::oneshot;

use crate::clock::FrameClock;
use crate::error::HostError;
use crate::output::{self, Output, OutputKind};

/// How often an idle thread brings the render clock up to date.
const TICK: Duration = Duration::from_millis(10);

pub(crate) type Reply = oneshot::Sender<Result<(), PlatformError>>;

// ── Commands ───────────────────────────────────────────────────────

/// A command sent from a [`HostContext`](crate::HostContext) to its thread.
pub(crate) enum ContextCommand {
    /// Start rendering.
    Resume { reply: Reply },

    /// Stop rendering; the clock holds.
    Suspend { reply: Reply },

    /// Stop rendering and end the thread.
    Close { reply: Reply },

    /// Install a named processing module.
    LoadModule { name: String, reply: Reply },

    /// Names of the modules installed so far.
    LoadedModules { reply: oneshot::Sender<Vec<String>> },

    /// Render now (fire-and-forget).
    Ping,

    /// End the thread without replying; sent when the proxy is dropped.
    Shutdown,
}

// ── Spawning ───────────────────────────────────────────────────────

pub(crate) struct ThreadSetup {
    pub name: String,
    pub output: OutputKind,
    pub sample_rate: u32,
    pub available_modules: Arc<[String]>,
    pub state: Arc<Mutex<ContextState>>,
}

/// Spawn the thread. The output is opened on the new thread and the result
/// reported through `init`.
pub(crate) fn spawn(
    setup: ThreadSetup,
    init: oneshot::Sender<Result<Arc<FrameClock>, HostError>>,
) -> Result<(mpsc::Sender<ContextCommand>, thread::JoinHandle<()>), HostError> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<ContextCommand>();
    let handle = thread::Builder::new()
        .name(setup.name.clone())
        .spawn(move || run(setup, &cmd_rx, init))?;
    Ok((cmd_tx, handle))
}

// ── Event loop ─────────────────────────────────────────────────────

fn run(
    setup: ThreadSetup,
    cmd_rx: &mpsc::Receiver<ContextCommand>,
    init: oneshot::Sender<Result<Arc<FrameClock>, HostError>>,
) {
    let (mut output, clock) = match output::open(setup.output, setup.sample_rate) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = init.send(Err(e));
            return;
        }
    };
    // Native hosts start rendering right away.
    if let Err(e) = output.start() {
        let _ = init.send(Err(e));
        return;
    }
    set_state(&setup.state, ContextState::Running);
    if init.send(Ok(clock)).is_err() {
        // Creator gave up waiting.
        set_state(&setup.state, ContextState::Closed);
        return;
    }

    let mut loaded: Vec<String> = Vec::new();
    loop {
        let command = match cmd_rx.recv_timeout(TICK) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => {
                output.render();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match command {
            ContextCommand::Resume { reply } => {
                let result = output
                    .start()
                    .map(|()| set_state(&setup.state, ContextState::Running))
                    .map_err(|e| PlatformError::Resume(e.to_string()));
                let _ = reply.send(result);
            }

            ContextCommand::Suspend { reply } => {
                let result = output
                    .pause()
                    .map(|()| set_state(&setup.state, ContextState::Suspended))
                    .map_err(|e| PlatformError::Suspend(e.to_string()));
                let _ = reply.send(result);
            }

            ContextCommand::LoadModule { name, reply } => {
                let result = if setup.available_modules.contains(&name) {
                    tracing::debug!(thread = %setup.name, module = %name, "Processing module loaded");
                    loaded.push(name);
                    Ok(())
                } else {
                    Err(HostError::UnknownModule(name).into())
                };
                let _ = reply.send(result);
            }

            ContextCommand::LoadedModules { reply } => {
                let _ = reply.send(loaded.clone());
            }

            ContextCommand::Ping => output.render(),

            ContextCommand::Close { reply } => {
                let _ = output.pause();
                set_state(&setup.state, ContextState::Closed);
                let _ = reply.send(Ok(()));
                break;
            }

            ContextCommand::Shutdown => break,
        }
    }

    // `output` is dropped here, on the audio thread.
    set_state(&setup.state, ContextState::Closed);
    tracing::debug!(thread = %setup.name, "Audio thread shutting down");
}

fn set_state(state: &Mutex<ContextState>, next: ContextState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}
