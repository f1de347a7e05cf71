#![doc = include_str!(concat!(env!("OUT_DIR"), "/README_GENERATED.md"))]
#![deny(unused_crate_dependencies)]

pub mod clock;
pub mod context;
pub mod error;
pub mod output;
pub mod platform;
mod thread;

pub use clock::FrameClock;
pub use context::HostContext;
pub use error::HostError;
pub use output::OutputKind;
pub use platform::HostPlatform;
