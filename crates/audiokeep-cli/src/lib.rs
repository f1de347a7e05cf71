#![doc = include_str!(concat!(env!("OUT_DIR"), "/README_GENERATED.md"))]
#![deny(unsafe_code)]
#![deny(unused_crate_dependencies)]

pub mod commands;
pub mod error;
pub mod handlers;
pub mod parser;
pub mod settings;

pub use commands::{Commands, SimulateArgs};
pub use error::CliError;
pub use parser::Cli;
