//! Minimal configuration loading for Lockstep.
//!
//! This crate provides configuration loading with minimal dependencies so the
//! engine and the binary can share it without pulling in the async stack.
//!
//! # Configuration Philosophy
//!
//! - **Infrastructure** (`ApiConfig`, `TelemetryConfig`): where the sync API
//!   lives and how we log. Fixed for the life of the process.
//!
//! - **Tuning** (`SyncConfig`): cadences and thresholds that seed the sync
//!   engine (tick, drift tolerance, cooldowns, countdown length).
//!
//! # Usage
//!
//! ```rust,no_run
//! use lockconf::LockConfig;
//!
//! let config = LockConfig::load().expect("Failed to load config");
//! println!("API: {}", config.api.base_url);
//! println!("Drift tolerance: {}s", config.sync.drift_tolerance);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, field by field):
//! 1. `/etc/lockstep/config.toml` (system)
//! 2. `~/.config/lockstep/config.toml` (user)
//! 3. `./lockstep.toml` (local override) or an explicit path
//! 4. Environment variables (`LOCKSTEP_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [api]
//! base_url = "https://sync.example.com/api/"
//! timeout_ms = 10000
//!
//! [sync]
//! tick_ms = 1000
//! drift_tolerance = 0.3
//! countdown_secs = 3
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod infra;
pub mod loader;
pub mod tuning;

pub use infra::{ApiConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use tuning::SyncConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete Lockstep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LockConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl LockConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file taking the place of
    /// `./lockstep.toml`. System and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::into_config(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    ///
    /// The auth token is never written out.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# Lockstep Configuration\n\n");

        output.push_str("[api]\n");
        output.push_str(&format!("base_url = \"{}\"\n", self.api.base_url));
        output.push_str(&format!("timeout_ms = {}\n", self.api.timeout_ms));
        if self.api.auth_token.is_some() {
            output.push_str("# auth_token is set (hidden)\n");
        }

        output.push_str("\n[sync]\n");
        output.push_str(&format!("tick_ms = {}\n", self.sync.tick_ms));
        output.push_str(&format!("drift_tolerance = {}\n", self.sync.drift_tolerance));
        output.push_str(&format!(
            "correction_cooldown_ms = {}\n",
            self.sync.correction_cooldown_ms
        ));
        output.push_str(&format!("seek_timeout_ms = {}\n", self.sync.seek_timeout_ms));
        output.push_str(&format!(
            "max_correction_failures = {}\n",
            self.sync.max_correction_failures
        ));
        output.push_str(&format!("countdown_secs = {}\n", self.sync.countdown_secs));
        output.push_str(&format!(
            "report_interval_ms = {}\n",
            self.sync.report_interval_ms
        ));
        output.push_str(&format!(
            "max_unready_ticks = {}\n",
            self.sync.max_unready_ticks
        ));
        output.push_str(&format!("pin_timeout_ms = {}\n", self.sync.pin_timeout_ms));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));
        output.push_str(&format!("json = {}\n", self.telemetry.json));

        output
    }
}
