//! Server configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_control::ControlConfig;
use fleet_control::config::DEFAULT_SWEEP_BATCH_SIZE;
use fleet_core::{Error, Result};

use crate::directory::parse_server_list;

/// Default offline threshold in seconds.
pub const DEFAULT_OFFLINE_AFTER_SECONDS: u64 = 120;

/// Default audit append timeout in milliseconds.
pub const DEFAULT_AUDIT_TIMEOUT_MS: u64 = 2_000;

/// Configuration for the fleet API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode (pretty logs instead of JSON).
    pub debug: bool,

    /// Offline threshold used when a sweep request omits one, and by the
    /// periodic sweep.
    pub offline_after_seconds: u64,

    /// Interval of the background offline sweep. `None` disables it.
    #[serde(default)]
    pub sweep_interval_seconds: Option<u64>,

    /// Nodes examined per sweep batch.
    pub sweep_batch_size: usize,

    /// Upper bound on a single audit append, in milliseconds.
    pub audit_timeout_ms: u64,

    /// Static server directory (`server_id -> host`), display only.
    #[serde(default)]
    pub servers: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            offline_after_seconds: DEFAULT_OFFLINE_AFTER_SECONDS,
            sweep_interval_seconds: None,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            audit_timeout_ms: DEFAULT_AUDIT_TIMEOUT_MS,
            servers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `FLEET_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the variable when a value
    /// cannot be parsed or is out of range.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("FLEET_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("FLEET_DEBUG")? {
            config.debug = debug;
        }
        if let Some(secs) = env_u64("FLEET_OFFLINE_AFTER_SECONDS")? {
            config.offline_after_seconds = secs;
        }
        config.sweep_interval_seconds =
            env_u64("FLEET_SWEEP_INTERVAL_SECONDS")?.filter(|secs| *secs > 0);
        if let Some(batch) = env_usize("FLEET_SWEEP_BATCH_SIZE")? {
            config.sweep_batch_size = batch;
        }
        if let Some(ms) = env_u64("FLEET_AUDIT_TIMEOUT_MS")? {
            config.audit_timeout_ms = ms;
        }
        if let Some(servers) = env_string("FLEET_SERVERS") {
            config.servers = parse_server_list("FLEET_SERVERS", &servers)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_batch_size == 0 {
            return Err(Error::InvalidInput(
                "FLEET_SWEEP_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }
        if self.audit_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "FLEET_AUDIT_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }
        fleet_control::liveness::threshold_from_secs(self.offline_after_seconds).map_err(|_| {
            Error::InvalidInput(format!(
                "FLEET_OFFLINE_AFTER_SECONDS is out of range: {}",
                self.offline_after_seconds
            ))
        })?;
        Ok(())
    }

    /// Control-plane tunables derived from this configuration.
    #[must_use]
    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            sweep_batch_size: self.sweep_batch_size,
            audit_timeout: Duration::from_millis(self.audit_timeout_ms),
        }
    }

    /// Interval of the background sweep, if enabled.
    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_seconds.map(Duration::from_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
