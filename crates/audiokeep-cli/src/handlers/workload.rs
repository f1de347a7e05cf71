//! Synthetic consumers that keep the context sources busy.

use std::time::Duration;

use audiokeep_core::{ContextError, ContextSource};
use tokio::task::JoinHandle;

/// How long each use of the context lasts.
const USE_FOR: Duration = Duration::from_millis(250);

/// Pause between uses.
const IDLE_FOR: Duration = Duration::from_secs(1);

/// Acquire a lease on `source` and use the context periodically until the
/// source is disposed. Resolves to the number of completed uses.
pub(crate) fn spawn_consumer(
    source: &ContextSource,
    operation: &str,
) -> Result<JoinHandle<u64>, ContextError> {
    let lease = source.acquire(operation)?;
    Ok(tokio::spawn(async move {
        let mut uses = 0;
        loop {
            match lease.use_context(|_| tokio::time::sleep(USE_FOR)).await {
                Ok(()) => uses += 1,
                Err(ContextError::Disposed) => break,
                Err(e) => {
                    tracing::warn!(operation = %lease.operation_name(), error = %e, "Context use failed");
                }
            }
            tokio::time::sleep(IDLE_FOR).await;
        }
        uses
    }))
}
