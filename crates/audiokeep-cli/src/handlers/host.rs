//! Host command handler: keep contexts alive on the native host platform.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use audiokeep_core::{AudioSessionManager, ContextPurpose, SessionConfig};
use audiokeep_host::HostPlatform;
use tokio::time::Instant;

use super::report::{print_status, spawn_event_printer};
use super::workload::spawn_consumer;
use crate::error::CliError;

/// Run both sources on the host platform for `seconds`.
pub async fn execute(config: &SessionConfig, seconds: f64, json: bool) -> Result<()> {
    let duration = Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|duration| !duration.is_zero())
        .ok_or_else(|| CliError::Arguments(format!("--seconds must be positive, got {seconds}")))?;

    let platform = Arc::new(HostPlatform::new());
    let manager = AudioSessionManager::start(platform.clone(), config);
    let start = Instant::now();

    let printers: Vec<_> = ContextPurpose::ALL
        .iter()
        .map(|&purpose| spawn_event_printer(manager.source(purpose), json, start))
        .collect();
    let consumers = ContextPurpose::ALL
        .iter()
        .map(|&purpose| spawn_consumer(manager.source(purpose), &format!("host-{purpose}")))
        .collect::<Result<Vec<_>, _>>()
        .map_err(CliError::from)?;

    tokio::time::sleep(duration).await;
    print_status(&manager.status(), json);
    manager.dispose().await;

    let mut uses = 0;
    for consumer in consumers {
        uses += consumer.await?;
    }
    for printer in printers {
        printer.abort();
    }
    tracing::info!(
        contexts = platform.created_count(),
        uses,
        "Host session finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn out_of_range_durations_are_usage_errors() {
        for seconds in [0.0, -1.0, f64::NAN, 1e30] {
            let err = execute(&SessionConfig::default(), seconds, false)
                .await
                .unwrap_err();
            let cli = err.downcast_ref::<CliError>().unwrap();
            assert_eq!(cli.exit_code(), 2, "{seconds}");
        }
    }
}
