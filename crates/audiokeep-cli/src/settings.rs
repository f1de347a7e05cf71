//! Configuration loading and logging setup.

use std::path::Path;

use audiokeep_core::SessionConfig;
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

/// Load the session configuration, falling back to defaults without a file.
pub fn load_config(path: Option<&Path>) -> Result<SessionConfig, CliError> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .map_err(|e| CliError::Io(format!("{}: {e}", path.display())))?;
    let config = SessionConfig::from_json_str(&json)?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
