//! Simulate command handler: a scripted run on the simulated platform.
//!
//! The simulated platform behaves like a browser: contexts stay suspended
//! until a gesture, a device sleep revokes activation, and faults can be
//! injected. The timeline given on the command line is replayed in real
//! time while both sources' events are printed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use audiokeep_core::{
    AudioSessionManager, BackgroundState, ContextPurpose, InteractionKind, SessionConfig,
    SimulatedPlatform,
};
use tokio::time::Instant;

use super::report::{print_status, spawn_event_printer};
use super::workload::spawn_consumer;
use crate::commands::SimulateArgs;
use crate::error::CliError;

/// A scripted step of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Gesture,
    Break,
    Sleep,
    Background,
    Foreground,
}

/// Expand the arguments into a time-ordered list of actions.
pub fn timeline(args: &SimulateArgs) -> Result<Vec<(Duration, Action)>, CliError> {
    let total = seconds("--seconds", args.seconds)?;
    if total.is_zero() {
        return Err(CliError::Arguments("--seconds must be positive".to_string()));
    }

    let mut steps = Vec::new();
    if let Some(every) = args.gesture_every {
        let every = seconds("--gesture-every", every)?;
        if every.is_zero() {
            return Err(CliError::Arguments(
                "--gesture-every must be positive".to_string(),
            ));
        }
        let mut at = every;
        while at <= total {
            steps.push((at, Action::Gesture));
            at += every;
        }
    }
    for (flag, value, action) in [
        ("--break-at", args.break_at, Action::Break),
        ("--sleep-at", args.sleep_at, Action::Sleep),
        ("--background-at", args.background_at, Action::Background),
        ("--foreground-at", args.foreground_at, Action::Foreground),
    ] {
        if let Some(value) = value {
            let at = seconds(flag, value)?;
            if at <= total {
                steps.push((at, action));
            }
        }
    }
    steps.sort_by_key(|(at, _)| *at);
    Ok(steps)
}

fn seconds(flag: &str, value: f64) -> Result<Duration, CliError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| CliError::Arguments(format!("{flag} must be a non-negative number, got {value}")))
}

fn apply(manager: &AudioSessionManager, platform: &SimulatedPlatform, action: Action) {
    tracing::info!(?action, "Simulation step");
    match action {
        Action::Gesture => manager.report_interaction(InteractionKind::Click),
        Action::Break => {
            for purpose in ContextPurpose::ALL {
                manager.source(purpose).break_context();
            }
        }
        Action::Sleep => {
            platform.simulate_sleep();
            manager.on_device_wake();
        }
        Action::Background => manager.update_background_state(BackgroundState::BackgroundIdle),
        Action::Foreground => manager.update_background_state(BackgroundState::Foreground),
    }
}

/// Replay the timeline against a fresh session.
pub async fn execute(config: &SessionConfig, args: &SimulateArgs) -> Result<()> {
    let steps = timeline(args)?;
    let platform = Arc::new(SimulatedPlatform::new());
    let manager = AudioSessionManager::start(platform.clone(), config);
    let start = Instant::now();

    let printers: Vec<_> = ContextPurpose::ALL
        .iter()
        .map(|&purpose| spawn_event_printer(manager.source(purpose), args.json, start))
        .collect();
    let consumers = ContextPurpose::ALL
        .iter()
        .map(|&purpose| spawn_consumer(manager.source(purpose), &format!("simulated-{purpose}")))
        .collect::<Result<Vec<_>, _>>()
        .map_err(CliError::from)?;

    for (at, action) in steps {
        tokio::time::sleep_until(start + at).await;
        apply(&manager, &platform, action);
    }
    tokio::time::sleep_until(start + Duration::from_secs_f64(args.seconds)).await;

    print_status(&manager.status(), args.json);
    manager.dispose().await;

    let mut uses = 0;
    for consumer in consumers {
        uses += consumer.await?;
    }
    for printer in printers {
        printer.abort();
    }
    tracing::info!(
        created = platform.created_count(),
        closed = platform.closed_count(),
        resumes = platform.resume_count(),
        uses,
        "Simulation finished"
    );
    Ok(())
}
