//! Integration tests for the `audiokeep` binary.
//!
//! # What is tested
//!
//! - `config` prints the effective configuration as JSON
//! - Configuration and argument errors map to their exit codes

use std::io::Write;
use std::process::Command;

fn audiokeep() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_audiokeep"));
    command.env_remove("AUDIOKEEP_CONFIG").env("RUST_LOG", "error");
    command
}

#[test]
fn config_prints_effective_configuration() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"source": {{"close_debounce_ms": 9000}}}}"#).unwrap();

    let output = audiokeep()
        .args(["config", "--config"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let printed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(printed["source"]["close_debounce_ms"], 9000);
    assert_eq!(printed["source"]["suspend_debounce_ms"], 2000);
    assert_eq!(printed["playback"]["sample_rate"], 48000);
}

#[test]
fn missing_config_file_is_an_io_error() {
    let output = audiokeep()
        .args(["config", "--config", "/nonexistent/audiokeep.json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn invalid_configuration_is_a_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"playback": {{"sample_rate": 0}}}}"#).unwrap();

    let output = audiokeep()
        .args(["config", "--config"])
        .arg(file.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(78));
}

#[test]
fn invalid_timeline_is_an_argument_error() {
    let output = audiokeep()
        .args(["simulate", "--seconds", "0"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn oversized_host_duration_is_an_argument_error() {
    let output = audiokeep()
        .args(["host", "--seconds", "1e30"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
