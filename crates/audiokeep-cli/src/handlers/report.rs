//! Event and status printing shared by the session handlers.

use audiokeep_core::{ContextSource, SourceEvent, SourceEventKind, SourceStatus};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Print every event of `source` until aborted.
pub(crate) fn spawn_event_printer(source: &ContextSource, json: bool, start: Instant) -> JoinHandle<()> {
    let mut events = source.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event, json, start),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &SourceEvent, json: bool, start: Instant) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!(error = %e, "Failed to serialize event"),
        }
        return;
    }
    println!(
        "[{:>8.3}s] {:<9} {}",
        start.elapsed().as_secs_f64(),
        event.purpose,
        describe(&event.kind)
    );
}

pub(crate) fn describe(kind: &SourceEventKind) -> String {
    match kind {
        SourceEventKind::ContextCreated { context_id } => format!("created {context_id}"),
        SourceEventKind::ContextClosed { context_id } => format!("closed {context_id}"),
        SourceEventKind::Ready { context_id } => format!("ready {context_id}"),
        SourceEventKind::NotReady => "not ready".to_string(),
        SourceEventKind::Suspended { context_id } => format!("suspended {context_id} (idle)"),
        SourceEventKind::HealthTestFailed { context_id, reason } => {
            format!("health test failed on {context_id}: {reason}")
        }
        SourceEventKind::Escalated {
            resume_count,
            interactive_resume_count,
        } => format!(
            "escalated after {resume_count} resumes ({interactive_resume_count} interactive), waiting for a gesture"
        ),
        SourceEventKind::AwaitingGesture { context_id } => {
            format!("{context_id} waiting for a gesture")
        }
        SourceEventKind::StateChanged { state } => format!("state {state}"),
    }
}

pub(crate) fn print_status(statuses: &[SourceStatus], json: bool) {
    if json {
        match serde_json::to_string(statuses) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!(error = %e, "Failed to serialize status"),
        }
        return;
    }
    println!();
    println!(
        "{:<9} {:<9} {:<6} {:<8} {:<10} {:>7} {:>6}",
        "PURPOSE", "STATE", "READY", "CONTEXT", "CTX STATE", "LEASES", "IN USE"
    );
    for status in statuses {
        println!(
            "{:<9} {:<9} {:<6} {:<8} {:<10} {:>7} {:>6}",
            status.purpose.to_string(),
            status.state.to_string(),
            status.is_ready,
            status
                .context_id
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
            status
                .context_state
                .map_or_else(|| "-".to_string(), |state| state.to_string()),
            status.lease_count,
            status.leases_in_use,
        );
    }
}

#[cfg(test)]
mod tests {
    use audiokeep_core::MaintainState;

    use super::*;

    #[test]
    fn descriptions_are_readable() {
        assert_eq!(describe(&SourceEventKind::NotReady), "not ready");
        assert!(
            describe(&SourceEventKind::Escalated {
                resume_count: 4,
                interactive_resume_count: 3,
            })
            .contains("3 interactive")
        );
        assert!(
            describe(&SourceEventKind::StateChanged {
                state: MaintainState::Fixing,
            })
            .starts_with("state ")
        );
    }
}
