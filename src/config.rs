//! Configuration loading and persistence.
//!
//! Handles reading and writing the sublink configuration file and turning
//! it into the [`Timings`] the connection manager runs on. Every value can
//! be overridden through a `SUBLINK_*` environment variable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;
use crate::transport::Endpoint;

/// Configuration for the sublink service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Broker host used for publishes before any CONNECT arrives.
    pub default_host: String,
    /// Broker port used for publishes before any CONNECT arrives.
    pub default_port: u16,
    /// Debounce window for CONNECT/DISCONNECT, in milliseconds.
    pub debounce_ms: u64,
    /// Delay between subscription and the first liveness probe, in milliseconds.
    pub liveness_start_delay_ms: u64,
    /// Interval between liveness probes, in seconds.
    pub liveness_interval_secs: u64,
    /// Fixed delay before a failure-triggered reconnect, in seconds.
    pub reconnect_backoff_secs: u64,
    /// Timeout for opening a transport connection, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_host: constants::DEFAULT_HOST.to_string(),
            default_port: constants::DEFAULT_PORT,
            debounce_ms: duration_millis(constants::DEFAULT_DEBOUNCE),
            liveness_start_delay_ms: duration_millis(constants::LIVENESS_START_DELAY),
            liveness_interval_secs: constants::DEFAULT_LIVENESS_INTERVAL.as_secs(),
            reconnect_backoff_secs: constants::RECONNECT_BACKOFF.as_secs(),
            connect_timeout_secs: constants::CONNECT_TIMEOUT.as_secs(),
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Resolved durations used by the connection manager.
///
/// Built from [`Config::timings`] in production; tests construct it
/// directly to shrink or stretch individual delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Debounce window shared by CONNECT and DISCONNECT.
    pub debounce: Duration,
    /// Delay before the first liveness probe after subscribing.
    pub liveness_start_delay: Duration,
    /// Interval between liveness probes.
    pub liveness_interval: Duration,
    /// Delay before a scheduled reconnect attempt.
    pub reconnect_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            debounce: constants::DEFAULT_DEBOUNCE,
            liveness_start_delay: constants::LIVENESS_START_DELAY,
            liveness_interval: constants::DEFAULT_LIVENESS_INTERVAL,
            reconnect_backoff: constants::RECONNECT_BACKOFF,
        }
    }
}

/// `SUBLINK_ENV=test` keeps config files inside the crate.
fn is_test_env(value: Option<&str>) -> bool {
    value == Some("test")
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `SUBLINK_CONFIG_DIR` env var: explicit override
    /// 2. `SUBLINK_ENV=test`: `tmp/sublink-test` under the crate
    /// 3. Default: platform config dir joined with `sublink`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SUBLINK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if is_test_env(std::env::var("SUBLINK_ENV").ok().as_deref()) {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/sublink-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("sublink")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides. A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = Self::load_from(&path).unwrap_or_else(|e| {
            log::debug!("[Config] Using defaults ({e:#})");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from an explicit file path, without env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or is not valid JSON.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Applies `SUBLINK_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary key lookup.
    ///
    /// Values that fail to parse are ignored and the previous value is kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("SUBLINK_HOST") {
            self.default_host = host;
        }

        if let Some(port) = lookup("SUBLINK_PORT").and_then(|v| v.parse().ok()) {
            self.default_port = port;
        }

        if let Some(ms) = lookup("SUBLINK_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.debounce_ms = ms;
        }

        if let Some(ms) = lookup("SUBLINK_LIVENESS_START_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.liveness_start_delay_ms = ms;
        }

        if let Some(secs) = lookup("SUBLINK_LIVENESS_INTERVAL").and_then(|v| v.parse().ok()) {
            self.liveness_interval_secs = secs;
        }

        if let Some(secs) = lookup("SUBLINK_RECONNECT_BACKOFF").and_then(|v| v.parse().ok()) {
            self.reconnect_backoff_secs = secs;
        }

        if let Some(secs) = lookup("SUBLINK_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
    }

    /// Persists the current configuration to the config directory and
    /// returns the path written.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_dir()?.join("config.json");
        self.save_to(&path)?;
        Ok(path)
    }

    /// Persists the current configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Durations for the connection manager.
    #[must_use]
    pub fn timings(&self) -> Timings {
        Timings {
            debounce: Duration::from_millis(self.debounce_ms),
            liveness_start_delay: Duration::from_millis(self.liveness_start_delay_ms),
            liveness_interval: Duration::from_secs(self.liveness_interval_secs),
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
        }
    }

    /// Timeout for opening a single transport connection.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Endpoint used for publishes before any CONNECT arrives.
    #[must_use]
    pub fn default_endpoint(&self) -> Endpoint {
        Endpoint::new(self.default_host.clone(), self.default_port)
    }
}
