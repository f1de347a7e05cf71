//! Outputs that drive a context's render clock.
//!
//! Outputs live on the context's audio thread for their whole lifetime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::FrameClock;
use crate::error::HostError;

/// Where a context renders to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputKind {
    /// A timer-driven clock; no device is opened.
    #[default]
    Software,
    /// The default output device, rendering silence.
    #[cfg(feature = "cpal")]
    Device,
}

pub(crate) trait Output {
    fn start(&mut self) -> Result<(), HostError>;

    fn pause(&mut self) -> Result<(), HostError>;

    /// Bring the clock up to date. Called on every thread tick and on ping.
    fn render(&mut self);
}

/// Build the output for `kind` on the calling thread.
pub(crate) fn open(
    kind: OutputKind,
    sample_rate: u32,
) -> Result<(Box<dyn Output>, Arc<FrameClock>), HostError> {
    match kind {
        OutputKind::Software => {
            let clock = Arc::new(FrameClock::new(sample_rate));
            Ok((Box::new(SoftwareOutput::new(Arc::clone(&clock))), clock))
        }
        #[cfg(feature = "cpal")]
        OutputKind::Device => {
            let (output, clock) = device::DeviceOutput::open()?;
            Ok((Box::new(output), clock))
        }
    }
}

// ── Software ───────────────────────────────────────────────────────

/// Advances the clock by wall time elapsed while started.
pub(crate) struct SoftwareOutput {
    clock: Arc<FrameClock>,
    /// Frames rendered before the current run.
    base: u64,
    running_since: Option<Instant>,
}

impl SoftwareOutput {
    pub(crate) const fn new(clock: Arc<FrameClock>) -> Self {
        Self {
            clock,
            base: 0,
            running_since: None,
        }
    }
}

impl Output for SoftwareOutput {
    fn start(&mut self) -> Result<(), HostError> {
        if self.running_since.is_none() {
            self.base = self.clock.frames();
            self.running_since = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), HostError> {
        self.render();
        self.base = self.clock.frames();
        self.running_since = None;
        Ok(())
    }

    fn render(&mut self) {
        if let Some(since) = self.running_since {
            let rendered = frames_in(since.elapsed(), self.clock.sample_rate());
            self.clock.set(self.base.saturating_add(rendered));
        }
    }
}

fn frames_in(elapsed: Duration, sample_rate: u32) -> u64 {
    let frames = elapsed.as_nanos() * u128::from(sample_rate) / 1_000_000_000;
    u64::try_from(frames).unwrap_or(u64::MAX)
}

// ── Device ─────────────────────────────────────────────────────────

#[cfg(feature = "cpal")]
mod device {
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, SizedSample, Stream, StreamConfig};

    use super::Output;
    use crate::clock::FrameClock;
    use crate::error::HostError;

    /// A paused-until-started output stream writing silence.
    ///
    /// `cpal::Stream` is `!Send` on some platforms, which is why it stays on
    /// the audio thread.
    pub(crate) struct DeviceOutput {
        stream: Stream,
    }

    impl DeviceOutput {
        pub(crate) fn open() -> Result<(Self, Arc<FrameClock>), HostError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(HostError::NoOutputDevice)?;
            let supported = device
                .default_output_config()
                .map_err(|e| HostError::OutputStream(e.to_string()))?;
            let config = supported.config();
            let clock = Arc::new(FrameClock::new(config.sample_rate.0));

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build::<f32>(&device, &config, Arc::clone(&clock)),
                SampleFormat::I16 => build::<i16>(&device, &config, Arc::clone(&clock)),
                SampleFormat::U16 => build::<u16>(&device, &config, Arc::clone(&clock)),
                other => Err(HostError::OutputStream(format!(
                    "unsupported sample format {other:?}"
                ))),
            }?;
            stream
                .pause()
                .map_err(|e| HostError::OutputStream(e.to_string()))?;

            tracing::info!(
                device = %device.name().unwrap_or_default(),
                sample_rate = config.sample_rate.0,
                channels = config.channels,
                "Audio output initialized"
            );
            Ok((Self { stream }, clock))
        }
    }

    fn build<T: SizedSample + Send + 'static>(
        device: &Device,
        config: &StreamConfig,
        clock: Arc<FrameClock>,
    ) -> Result<Stream, HostError> {
        let channels = u64::from(config.channels.max(1));
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _| {
                    data.fill(T::EQUILIBRIUM);
                    clock.advance(data.len() as u64 / channels);
                },
                |err| tracing::warn!(error = %err, "Audio output stream error"),
                None,
            )
            .map_err(|e| HostError::OutputStream(e.to_string()))
    }

    impl Output for DeviceOutput {
        fn start(&mut self) -> Result<(), HostError> {
            self.stream
                .play()
                .map_err(|e| HostError::OutputStream(e.to_string()))
        }

        fn pause(&mut self) -> Result<(), HostError> {
            self.stream
                .pause()
                .map_err(|e| HostError::OutputStream(e.to_string()))
        }

        // The device callback advances the clock itself.
        fn render(&mut self) {}
    }
}
