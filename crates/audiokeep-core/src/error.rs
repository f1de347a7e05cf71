//! Error types for the audio context core.
//!
//! Three layers, matching who gets to see them:
//! - [`ContextError`] is the only error consumers ever receive.
//! - [`MaintainError`] is the maintenance loop's internal taxonomy; every
//!   variant is converted into a state transition and logged, never surfaced.
//! - [`PlatformError`] is what an [`AudioPlatform`](crate::platform::AudioPlatform)
//!   implementation reports.

use std::time::Duration;

/// Errors surfaced to consumers of a context source or lease.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The source (or the lease) has been disposed.
    #[error("Audio context source has been disposed")]
    Disposed,

    /// A caller-supplied cancellation token fired first.
    #[error("Audio context operation cancelled")]
    Cancelled,

    /// `use_context` was called while a previous `use_context` on the same
    /// lease is still outstanding.
    #[error("Lease '{0}' is already in use")]
    AlreadyInUse(String),

    /// No healthy context became available within the caller's bound.
    #[error("Audio context was not ready within {0:?}")]
    ReadyTimeout(Duration),

    /// No user gesture arrived within the caller's bound.
    #[error("No user interaction within {0:?}")]
    InteractionTimeout(Duration),
}

/// Errors reported by platform audio implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// The platform refused to construct a context.
    #[error("Failed to create audio context: {0}")]
    Create(String),

    /// A processing module could not be loaded into the context.
    #[error("Failed to load processing module '{name}': {reason}")]
    ModuleLoad { name: String, reason: String },

    /// `resume` was rejected by the platform.
    #[error("Audio context resume failed: {0}")]
    Resume(String),

    /// `suspend` was rejected by the platform.
    #[error("Audio context suspend failed: {0}")]
    Suspend(String),

    /// `close` was rejected by the platform.
    #[error("Audio context close failed: {0}")]
    Close(String),

    /// The context has already been closed.
    #[error("Audio context is closed")]
    Closed,

    /// The thread or task owning the context went away.
    #[error("Audio context owner is gone")]
    OwnerGone,
}

/// Internal error taxonomy of the maintenance loop.
///
/// `Stopped` unwinds the loop permanently; `Restarted`, `DeviceWake` and
/// `IdleClosed` recreate the context; `TooManyResumeAttempts` escalates; everything else
/// is retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MaintainError {
    /// Context construction or module load failed.
    #[error("Audio context creation failed: {0}")]
    CreationFailure(PlatformError),

    /// `resume` did not complete within the configured bound.
    #[error("Audio context resume timed out after {0:?}")]
    ResumeTimeout(Duration),

    /// `resume` completed but the context is still not running.
    #[error("Audio context resume completed, but the context is not running")]
    ResumeIneffective,

    /// `suspend` did not complete within the configured bound.
    #[error("Audio context suspend timed out after {0:?}")]
    SuspendTimeout(Duration),

    /// The context could not be suspended before a repair attempt.
    #[error("Couldn't suspend audio context")]
    SuspendFailure,

    /// The context reports running but isn't producing samples, or is in an
    /// unexpected state.
    #[error("Audio context health test failed: {0}")]
    HealthTestFailure(String),

    /// Resume attempt bounds are exhausted for this episode.
    #[error(
        "Too many resume attempts ({resume_count} total, {interactive_resume_count} interactive)"
    )]
    TooManyResumeAttempts {
        resume_count: u32,
        interactive_resume_count: u32,
    },

    /// The context was closed underneath the loop.
    #[error("Audio context is closed")]
    ContextClosed,

    /// The context was closed after idling in the background.
    #[error("Audio context closed while idle in background")]
    IdleClosed,

    /// The device woke up from sleep; the context must be recreated.
    #[error("Device woke up from sleep")]
    DeviceWake,

    /// `reset` was requested; the context must be recreated from scratch.
    #[error("Audio context reset requested")]
    Restarted,

    /// The loop was asked to stop.
    #[error("Maintenance stopped")]
    Stopped,

    /// Any other platform failure.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl MaintainError {
    /// Whether this error interrupts the current episode rather than
    /// describing a failed attempt.
    pub const fn is_interrupt(&self) -> bool {
        matches!(self, Self::Stopped | Self::Restarted | Self::DeviceWake)
    }
}

/// Configuration parse or validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value outside its valid range.
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_classification() {
        assert!(MaintainError::Stopped.is_interrupt());
        assert!(MaintainError::DeviceWake.is_interrupt());
        assert!(MaintainError::Restarted.is_interrupt());
        assert!(!MaintainError::ResumeIneffective.is_interrupt());
        assert!(!MaintainError::IdleClosed.is_interrupt());
    }

    #[test]
    fn platform_errors_convert_into_maintain_errors() {
        let err: MaintainError = PlatformError::Resume("denied".into()).into();
        assert_eq!(err.to_string(), "Audio context resume failed: denied");
    }

    #[test]
    fn escalation_message_names_both_counters() {
        let err = MaintainError::TooManyResumeAttempts {
            resume_count: 4,
            interactive_resume_count: 3,
        };
        assert_eq!(
            err.to_string(),
            "Too many resume attempts (4 total, 3 interactive)"
        );
    }
}
