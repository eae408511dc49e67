//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, LockConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// `LOCKSTEP_CONFIG` acts like a CLI path when none is given.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/lockstep/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("lockstep/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    let env_path = env::var("LOCKSTEP_CONFIG").ok().map(|v| expand_path(&v));
    if let Some(path) = cli_path.map(Path::to_path_buf).or(env_path) {
        if path.exists() {
            files.push(path);
            return files;
        }
    }

    let local = PathBuf::from("lockstep.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a config file as a raw TOML table.
///
/// The table is also checked against the typed schema so a bad value is
/// reported with the file it came from rather than after merging.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

/// Load a single config file on top of compiled defaults.
pub fn load_from_file(path: &Path) -> Result<LockConfig, ConfigError> {
    let table = load_table(path)?;
    into_config(table, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    // Type-check now; the merged result is deserialized again later.
    into_config(table.clone(), path)?;
    Ok(table)
}

pub(crate) fn into_config(table: toml::Table, path: &Path) -> Result<LockConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, recursing into sub-tables. Scalars and arrays
/// in `overlay` replace those in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut LockConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests never
/// touch the process environment.
pub fn apply_overrides_from<F>(config: &mut LockConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut record = |key: &str| sources.env_overrides.push(key.to_string());

    // API
    if let Some(v) = lookup("LOCKSTEP_API_URL") {
        config.api.base_url = v;
        record("LOCKSTEP_API_URL");
    }
    if let Some(v) = lookup("LOCKSTEP_API_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.api.timeout_ms = ms;
            record("LOCKSTEP_API_TIMEOUT_MS");
        }
    }
    if let Some(v) = lookup("LOCKSTEP_API_TOKEN") {
        config.api.auth_token = Some(v);
        record("LOCKSTEP_API_TOKEN");
    }

    // Sync tuning
    if let Some(v) = lookup("LOCKSTEP_TICK_MS") {
        if let Ok(ms) = v.parse() {
            config.sync.tick_ms = ms;
            record("LOCKSTEP_TICK_MS");
        }
    }
    if let Some(v) = lookup("LOCKSTEP_DRIFT_TOLERANCE") {
        if let Ok(tolerance) = v.parse::<f64>() {
            if tolerance.is_finite() && tolerance >= 0.0 {
                config.sync.drift_tolerance = tolerance;
                record("LOCKSTEP_DRIFT_TOLERANCE");
            }
        }
    }
    if let Some(v) = lookup("LOCKSTEP_COUNTDOWN_SECS") {
        if let Ok(secs) = v.parse() {
            config.sync.countdown_secs = secs;
            record("LOCKSTEP_COUNTDOWN_SECS");
        }
    }

    // Telemetry
    if let Some(v) = lookup("LOCKSTEP_LOG_LEVEL") {
        config.telemetry.log_level = v;
        record("LOCKSTEP_LOG_LEVEL");
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        record("RUST_LOG");
    }
    if let Some(v) = lookup("LOCKSTEP_LOG_JSON") {
        config.telemetry.json = matches!(v.as_str(), "1" | "true" | "yes");
        record("LOCKSTEP_LOG_JSON");
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
