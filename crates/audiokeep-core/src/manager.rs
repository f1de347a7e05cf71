//! Process-wide audio session manager.
//!
//! Owns the interaction gate, one context source per purpose and the device
//! wake detector. Construct it once at application start, hand out
//! references, dispose it at shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::gate::{InteractionGate, InteractionKind};
use crate::platform::{AudioPlatform, ContextPurpose};
use crate::source::{BackgroundState, ContextSource, SourceStatus};
use crate::wake::DeviceWakeDetector;

/// Entry point of the audio core.
#[derive(Debug)]
pub struct AudioSessionManager {
    gate: InteractionGate,
    playback: ContextSource,
    recording: ContextSource,
    wake: Arc<DeviceWakeDetector>,
    forwarder: CancellationToken,
    disposed: AtomicBool,
}

impl AudioSessionManager {
    /// Start both sources on `platform`.
    ///
    /// The gate is always interactive when the platform is. Must be called
    /// from within a tokio runtime.
    pub fn start(platform: Arc<dyn AudioPlatform>, config: &SessionConfig) -> Self {
        let gate = InteractionGate::new();
        if platform.is_always_interactive() {
            gate.set_always_interactive(true);
        }
        Self::with_gate(platform, gate, config)
    }

    /// Start both sources with an existing gate.
    pub fn with_gate(
        platform: Arc<dyn AudioPlatform>,
        gate: InteractionGate,
        config: &SessionConfig,
    ) -> Self {
        let playback = ContextSource::spawn(
            ContextPurpose::Playback,
            Arc::clone(&platform),
            gate.clone(),
            config,
        );
        let recording = ContextSource::spawn(
            ContextPurpose::Recording,
            Arc::clone(&platform),
            gate.clone(),
            config,
        );
        let wake = Arc::new(DeviceWakeDetector::spawn(&config.wake));
        let forwarder = CancellationToken::new();

        let mut wakes = wake.subscribe();
        let token = forwarder.clone();
        let targets = (gate.clone(), playback.clone(), recording.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    received = wakes.recv() => match received {
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            fan_out_wake(&targets.0, [&targets.1, &targets.2]);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        tracing::info!(
            platform = platform.name(),
            always_interactive = gate.is_always_interactive(),
            "Audio session manager started"
        );
        Self {
            gate,
            playback,
            recording,
            wake,
            forwarder,
            disposed: AtomicBool::new(false),
        }
    }

    pub const fn gate(&self) -> &InteractionGate {
        &self.gate
    }

    pub const fn source(&self, purpose: ContextPurpose) -> &ContextSource {
        match purpose {
            ContextPurpose::Playback => &self.playback,
            ContextPurpose::Recording => &self.recording,
        }
    }

    pub const fn playback(&self) -> &ContextSource {
        &self.playback
    }

    pub const fn recording(&self) -> &ContextSource {
        &self.recording
    }

    pub fn wake_detector(&self) -> &DeviceWakeDetector {
        &self.wake
    }

    /// Forward a user gesture from the input layer.
    pub fn report_interaction(&self, kind: InteractionKind) {
        self.gate.report_interaction(kind);
    }

    /// Forward a host visibility change to every source.
    pub fn update_background_state(&self, state: BackgroundState) {
        for source in self.sources() {
            source.update_background_state(state);
        }
    }

    /// Revoke interaction and recreate every context after a device wake.
    pub fn on_device_wake(&self) {
        fan_out_wake(&self.gate, self.sources());
    }

    pub fn status(&self) -> [SourceStatus; 2] {
        [self.playback.status(), self.recording.status()]
    }

    /// Dispose both sources and stop wake detection. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forwarder.cancel();
        self.wake.shutdown();
        futures_util::future::join(self.playback.dispose(), self.recording.dispose()).await;
        tracing::info!("Audio session manager disposed");
    }

    const fn sources(&self) -> [&ContextSource; 2] {
        [&self.playback, &self.recording]
    }
}

fn fan_out_wake(gate: &InteractionGate, sources: [&ContextSource; 2]) {
    gate.on_device_wake();
    for source in sources {
        source.on_device_wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimulatedPlatform;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn both_sources_become_ready_on_an_interactive_platform() {
        let platform = Arc::new(SimulatedPlatform::always_interactive());
        let manager = AudioSessionManager::start(platform.clone(), &SessionConfig::default());
        assert!(manager.gate().is_always_interactive());

        for purpose in ContextPurpose::ALL {
            let handle = manager
                .source(purpose)
                .when_ready_within(Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(handle.purpose(), purpose);
        }
        assert_eq!(platform.live_context_count(), 2);

        manager.dispose().await;
        manager.dispose().await;
        assert_eq!(platform.live_context_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_state_reaches_every_source() {
        let platform = Arc::new(SimulatedPlatform::always_interactive());
        let manager = AudioSessionManager::start(platform, &SessionConfig::default());

        manager.update_background_state(BackgroundState::BackgroundActive);
        assert_eq!(
            manager.playback().background_state(),
            BackgroundState::BackgroundActive
        );
        assert_eq!(
            manager.recording().background_state(),
            BackgroundState::BackgroundActive
        );
        manager.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reported_wake_revokes_interaction() {
        let platform = Arc::new(SimulatedPlatform::new());
        let manager = AudioSessionManager::start(platform, &SessionConfig::default());
        manager.report_interaction(InteractionKind::Click);
        assert!(manager.gate().is_interactive());

        manager.wake_detector().notify(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!manager.gate().is_interactive());
        assert_eq!(manager.gate().wake_epoch(), 1);
        manager.dispose().await;
    }
}
