//! Host platform error types.

use audiokeep_core::PlatformError;

/// Errors raised while setting up or driving a host audio context.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The audio thread could not be started.
    #[error("Failed to spawn audio thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// The audio thread exited before answering.
    #[error("Audio thread died")]
    AudioThreadDied,

    /// No audio output device found.
    #[error("No audio output device found")]
    NoOutputDevice,

    /// Failed to open or drive the output stream.
    #[error("Audio output stream error: {0}")]
    OutputStream(String),

    /// The requested processing module is not available on this host.
    #[error("Unknown processing module '{0}'")]
    UnknownModule(String),
}

impl From<HostError> for PlatformError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::AudioThreadDied => Self::OwnerGone,
            HostError::UnknownModule(name) => Self::ModuleLoad {
                reason: "not available on this host".to_string(),
                name,
            },
            other => Self::Create(other.to_string()),
        }
    }
}
