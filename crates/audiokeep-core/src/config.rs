//! Session configuration types and validation.
//!
//! Every field has a default, so a partial JSON document (or none at all)
//! yields a working configuration. Durations are stored as milliseconds and
//! exposed as [`Duration`]s through accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::platform::{ContextPurpose, LatencyHint};

/// Default sample rate for both playback and recording contexts.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Processing modules loaded into every new context unless configured otherwise.
pub const DEFAULT_MODULES: [&str; 3] = ["feeder", "opus-encoder", "vad"];

/// Timing and retry policy of a context source's maintenance loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Delay before the first context is created, so that application start
    /// can make progress first.
    pub startup_delay_ms: u64,

    /// Period of the health test while the context is healthy and in use.
    pub maintain_cycle_ms: u64,

    /// Delay between failed repair attempts.
    pub fix_cycle_ms: u64,

    /// Bound on a single `resume` call.
    pub max_resume_time_ms: u64,

    /// Bound on a single `suspend` call.
    pub max_suspend_time_ms: u64,

    /// Bound on context construction.
    pub create_timeout_ms: u64,

    /// Bound on `close`; the handle is dropped regardless.
    pub close_timeout_ms: u64,

    /// Clock sampling interval used right after activation or repair.
    pub short_test_interval_ms: u64,

    /// Clock sampling interval used by periodic supervision.
    pub long_test_interval_ms: u64,

    /// How many sampling intervals a health test may take before it fails.
    pub test_cycle_count: u32,

    /// Resume attempts allowed in one broken episode before escalating.
    pub max_resume_count: u32,

    /// Gesture-driven resume attempts allowed in one broken episode.
    pub max_interactive_resume_count: u32,

    /// Idle time in `BackgroundIdle` before the context is suspended.
    pub suspend_debounce_ms: u64,

    /// Further idle time before a suspended, unused context is closed.
    pub close_debounce_ms: u64,

    /// Delay before recreating after escalation on hosts that never
    /// deliver gestures.
    pub escalation_backoff_ms: u64,

    /// Lease count above which acquisitions are logged as suspicious.
    pub high_lease_count: usize,

    /// Skip clock-advance testing on always-interactive hosts and trust the
    /// reported state instead.
    pub trust_always_interactive: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: 300,
            maintain_cycle_ms: 2000,
            fix_cycle_ms: 300,
            max_resume_time_ms: 600,
            max_suspend_time_ms: 300,
            create_timeout_ms: 5000,
            close_timeout_ms: 1000,
            short_test_interval_ms: 150,
            long_test_interval_ms: 1000,
            test_cycle_count: 5,
            max_resume_count: 60,
            max_interactive_resume_count: 3,
            suspend_debounce_ms: 2000,
            close_debounce_ms: 5000,
            escalation_backoff_ms: 2000,
            high_lease_count: 100,
            trust_always_interactive: false,
        }
    }
}

impl SourceConfig {
    pub const fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub const fn maintain_cycle(&self) -> Duration {
        Duration::from_millis(self.maintain_cycle_ms)
    }

    pub const fn fix_cycle(&self) -> Duration {
        Duration::from_millis(self.fix_cycle_ms)
    }

    pub const fn max_resume_time(&self) -> Duration {
        Duration::from_millis(self.max_resume_time_ms)
    }

    pub const fn max_suspend_time(&self) -> Duration {
        Duration::from_millis(self.max_suspend_time_ms)
    }

    pub const fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub const fn short_test_interval(&self) -> Duration {
        Duration::from_millis(self.short_test_interval_ms)
    }

    pub const fn long_test_interval(&self) -> Duration {
        Duration::from_millis(self.long_test_interval_ms)
    }

    pub const fn suspend_debounce(&self) -> Duration {
        Duration::from_millis(self.suspend_debounce_ms)
    }

    pub const fn close_debounce(&self) -> Duration {
        Duration::from_millis(self.close_debounce_ms)
    }

    pub const fn escalation_backoff(&self) -> Duration {
        Duration::from_millis(self.escalation_backoff_ms)
    }

    /// Validate ranges that would otherwise stall or spin the loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("source.maintain_cycle_ms", self.maintain_cycle_ms),
            ("source.fix_cycle_ms", self.fix_cycle_ms),
            ("source.max_resume_time_ms", self.max_resume_time_ms),
            ("source.max_suspend_time_ms", self.max_suspend_time_ms),
            ("source.create_timeout_ms", self.create_timeout_ms),
            ("source.short_test_interval_ms", self.short_test_interval_ms),
            ("source.test_cycle_count", u64::from(self.test_cycle_count)),
            ("source.max_resume_count", u64::from(self.max_resume_count)),
            (
                "source.max_interactive_resume_count",
                u64::from(self.max_interactive_resume_count),
            ),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.long_test_interval_ms < self.short_test_interval_ms {
            return Err(ConfigError::Invalid {
                field: "source.long_test_interval_ms",
                reason: format!(
                    "must not be shorter than short_test_interval_ms ({})",
                    self.short_test_interval_ms
                ),
            });
        }

        Ok(())
    }
}

/// Per-purpose context construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurposeConfig {
    /// Requested sample rate in Hz.
    pub sample_rate: u32,

    /// Requested output latency class.
    pub latency_hint: LatencyHint,

    /// Processing modules loaded into every new context.
    pub modules: Vec<String>,
}

impl Default for PurposeConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            latency_hint: LatencyHint::Balanced,
            modules: DEFAULT_MODULES.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Device-wake watchdog settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Whether the manager runs its own wall-clock watchdog.
    pub enabled: bool,

    /// Watchdog tick.
    pub check_interval_ms: u64,

    /// Minimum unexplained wall-clock gap treated as a sleep.
    pub threshold_ms: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 1000,
            threshold_ms: 5000,
        }
    }
}

impl WakeConfig {
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub const fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }
}

/// Complete configuration of an [`AudioSessionManager`](crate::AudioSessionManager).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub source: SourceConfig,
    pub playback: PurposeConfig,
    pub recording: PurposeConfig,
    pub wake: WakeConfig,
}

impl SessionConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Construction parameters for the given purpose.
    pub const fn purpose(&self, purpose: ContextPurpose) -> &PurposeConfig {
        match purpose {
            ContextPurpose::Playback => &self.playback,
            ContextPurpose::Recording => &self.recording,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source.validate()?;

        for (field, purpose) in [
            ("playback.sample_rate", &self.playback),
            ("recording.sample_rate", &self.recording),
        ] {
            if purpose.sample_rate == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.wake.enabled && self.wake.check_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "wake.check_interval_ms",
                reason: "must be greater than zero when the watchdog is enabled".to_string(),
            });
        }

        Ok(())
    }
}
