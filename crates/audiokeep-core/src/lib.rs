#![doc = include_str!(concat!(env!("OUT_DIR"), "/README_GENERATED.md"))]
#![deny(unused_crate_dependencies)]

pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod lease;
pub mod manager;
pub mod platform;
pub mod source;
pub mod wake;

// Re-export key types for convenience
pub use config::{PurposeConfig, SessionConfig, SourceConfig, WakeConfig};
pub use error::{ConfigError, ContextError, MaintainError, PlatformError};
pub use events::{SourceEvent, SourceEventKind};
pub use gate::{InteractionGate, InteractionKind, InteractionRegistration, UserActivation};
pub use lease::{ContextChange, ContextLease, LeaseId, LeaseObserver};
pub use manager::AudioSessionManager;
pub use platform::sim::SimulatedPlatform;
pub use platform::{
    Activation, AudioContextHandle, AudioPlatform, ContextId, ContextOptions, ContextPurpose,
    ContextState, LatencyHint, PlatformContext, PlatformFuture,
};
pub use source::{BackgroundState, ContextSource, MaintainState, SourceStatus};
pub use wake::{DeviceWake, DeviceWakeDetector, WakeWatchdog};
