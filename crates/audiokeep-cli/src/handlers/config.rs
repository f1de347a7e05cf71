//! Config command handler.

use anyhow::Result;
use audiokeep_core::SessionConfig;

/// Print the effective configuration as pretty JSON.
pub fn execute(config: &SessionConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
