//! Synchronization tuning - seeds the engine's timers and thresholds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cadences and thresholds used by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Drift sampler / scheduler tick in milliseconds.
    #[serde(default = "SyncConfig::default_tick_ms")]
    pub tick_ms: u64,

    /// Allowed divergence (seconds) between observed and configured offset.
    #[serde(default = "SyncConfig::default_drift_tolerance")]
    pub drift_tolerance: f64,

    /// Quiet period after a corrective seek settles.
    #[serde(default = "SyncConfig::default_correction_cooldown_ms")]
    pub correction_cooldown_ms: u64,

    /// How long a corrective seek may stay unsettled before it counts as failed.
    #[serde(default = "SyncConfig::default_seek_timeout_ms")]
    pub seek_timeout_ms: u64,

    /// Consecutive failed corrections before the session drops out of sync.
    #[serde(default = "SyncConfig::default_max_correction_failures")]
    pub max_correction_failures: u32,

    /// Countdown length in one-second ticks.
    #[serde(default = "SyncConfig::default_countdown_secs")]
    pub countdown_secs: u32,

    /// Minimum spacing between position reports.
    #[serde(default = "SyncConfig::default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Ticks a loaded stream may stay unready before the session is unusable.
    #[serde(default = "SyncConfig::default_max_unready_ticks")]
    pub max_unready_ticks: u32,

    /// How long timestamp pinning waits for both seeks to settle.
    #[serde(default = "SyncConfig::default_pin_timeout_ms")]
    pub pin_timeout_ms: u64,
}

impl SyncConfig {
    fn default_tick_ms() -> u64 {
        1000
    }

    fn default_drift_tolerance() -> f64 {
        0.3
    }

    fn default_correction_cooldown_ms() -> u64 {
        2000
    }

    fn default_seek_timeout_ms() -> u64 {
        3000
    }

    fn default_max_correction_failures() -> u32 {
        3
    }

    fn default_countdown_secs() -> u32 {
        3
    }

    fn default_report_interval_ms() -> u64 {
        1000
    }

    fn default_max_unready_ticks() -> u32 {
        15
    }

    fn default_pin_timeout_ms() -> u64 {
        5000
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn correction_cooldown(&self) -> Duration {
        Duration::from_millis(self.correction_cooldown_ms)
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn pin_timeout(&self) -> Duration {
        Duration::from_millis(self.pin_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_ms: Self::default_tick_ms(),
            drift_tolerance: Self::default_drift_tolerance(),
            correction_cooldown_ms: Self::default_correction_cooldown_ms(),
            seek_timeout_ms: Self::default_seek_timeout_ms(),
            max_correction_failures: Self::default_max_correction_failures(),
            countdown_secs: Self::default_countdown_secs(),
            report_interval_ms: Self::default_report_interval_ms(),
            max_unready_ticks: Self::default_max_unready_ticks(),
            pin_timeout_ms: Self::default_pin_timeout_ms(),
        }
    }
}
