//! Device wake detection.
//!
//! The monotonic clock stops while the device sleeps; the wall clock does
//! not. A watchdog ticking on a fixed interval therefore sees a wall-clock
//! gap far larger than its tick after the device wakes up. Hosts that learn
//! about sleeps some other way can report them through
//! [`DeviceWakeDetector::notify`].

use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::WakeConfig;

const CHANNEL_CAPACITY: usize = 16;

/// The device was asleep for roughly `slept_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceWake {
    pub slept_for: Duration,
}

/// Compare elapsed monotonic time with elapsed wall-clock time.
///
/// Returns a wake if the wall clock ran ahead by at least `threshold`.
pub fn detect_wake(monotonic: Duration, wall: Duration, threshold: Duration) -> Option<DeviceWake> {
    let gap = wall.saturating_sub(monotonic);
    (gap >= threshold).then_some(DeviceWake { slept_for: gap })
}

/// Policy-free watchdog that yields a [`DeviceWake`] per detected sleep.
pub struct WakeWatchdog {
    check_interval: Duration,
    threshold: Duration,
    cancel_token: CancellationToken,
}

impl WakeWatchdog {
    pub const fn new(
        check_interval: Duration,
        threshold: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            check_interval,
            threshold,
            cancel_token,
        }
    }

    /// Start watching. Completes when the cancellation token fires.
    pub fn monitor(self) -> impl Stream<Item = DeviceWake> {
        let Self {
            check_interval,
            threshold,
            cancel_token,
        } = self;

        stream! {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last_wall = Utc::now();
            let mut last_mono = Instant::now();
            tracing::debug!(?check_interval, ?threshold, "Starting device wake watchdog");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now_wall = Utc::now();
                        let wall = (now_wall - last_wall).to_std().unwrap_or_default();
                        let monotonic = last_mono.elapsed();
                        last_wall = now_wall;
                        last_mono = Instant::now();

                        if let Some(wake) = detect_wake(monotonic, wall, threshold) {
                            yield wake;
                        }
                    }
                    () = cancel_token.cancelled() => {
                        tracing::debug!("Device wake watchdog cancelled");
                        break;
                    }
                }
            }
        }
    }
}

/// Fan-out of device wakes, fed by a [`WakeWatchdog`] and/or by the host.
#[derive(Debug)]
pub struct DeviceWakeDetector {
    sender: broadcast::Sender<DeviceWake>,
    cancel_token: CancellationToken,
}

impl DeviceWakeDetector {
    /// A detector fed only through [`notify`](Self::notify).
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            cancel_token: CancellationToken::new(),
        }
    }

    /// A detector with a running watchdog, if enabled in `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &WakeConfig) -> Self {
        let detector = Self::new();
        if !config.enabled {
            return detector;
        }

        let watchdog = WakeWatchdog::new(
            config.check_interval(),
            config.threshold(),
            detector.cancel_token.child_token(),
        );
        let sender = detector.sender.clone();
        tokio::spawn(async move {
            let wakes = watchdog.monitor();
            futures_util::pin_mut!(wakes);
            while let Some(wake) = wakes.next().await {
                tracing::info!(slept_for = ?wake.slept_for, "Device woke up from sleep");
                let _ = sender.send(wake);
            }
        });
        detector
    }

    /// Report a wake detected elsewhere.
    pub fn notify(&self, slept_for: Duration) {
        tracing::info!(?slept_for, "Device wake reported");
        let _ = self.sender.send(DeviceWake { slept_for });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceWake> {
        self.sender.subscribe()
    }

    /// Stop the watchdog. Reported wakes are still delivered.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Default for DeviceWakeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceWakeDetector {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
