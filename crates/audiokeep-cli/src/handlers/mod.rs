//! Command handlers.

pub mod config;
pub mod host;
mod report;
mod workload;
pub mod simulate;
