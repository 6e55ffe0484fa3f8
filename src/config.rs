//! Environment-driven configuration.
//!
//! Everything has a sensible local default; env vars override. Timeouts
//! for requests stuck while the device is away are deliberately opt-in:
//! by default a queued request waits until someone decides it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::approval::QueueConfig;
use crate::error::ConfigError;
use crate::pairing::PairingStore;

/// Default bind address for the bridge server.
const DEFAULT_BIND: &str = "127.0.0.1:1646";
/// Default device probe interval in milliseconds.
const DEFAULT_PROBE_INTERVAL_MS: u64 = 1000;

/// Top-level configuration for the bridge daemon.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge server bind address (`KEYBRIDGE_BIND`).
    pub bind_addr: SocketAddr,
    /// Pairing database location (`KEYBRIDGE_STORE`).
    pub store_path: PathBuf,
    /// Device probe interval (`KEYBRIDGE_PROBE_INTERVAL_MS`).
    pub probe_interval: Duration,
    /// Expire undecided requests after this many seconds
    /// (`KEYBRIDGE_DECISION_TIMEOUT_SECS`; unset = never).
    pub decision_timeout: Option<Duration>,
    /// Bound how long an approved request waits for the device to return
    /// (`KEYBRIDGE_CONNECT_WAIT_SECS`; unset = wait indefinitely).
    pub connect_wait_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.parse().unwrap(),
            store_path: PairingStore::default_path(),
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
            decision_timeout: None,
            connect_wait_timeout: None,
        }
    }
}

impl BridgeConfig {
    /// Build configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = read_env("KEYBRIDGE_BIND") {
            config.bind_addr = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "KEYBRIDGE_BIND".to_string(),
                message: format!("not a socket address: {raw}"),
            })?;
        }

        if let Some(raw) = read_env("KEYBRIDGE_STORE") {
            config.store_path = PathBuf::from(raw);
        }

        if let Some(ms) = parse_env_u64("KEYBRIDGE_PROBE_INTERVAL_MS")? {
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "KEYBRIDGE_PROBE_INTERVAL_MS".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            config.probe_interval = Duration::from_millis(ms);
        }

        config.decision_timeout =
            parse_env_u64("KEYBRIDGE_DECISION_TIMEOUT_SECS")?.map(Duration::from_secs);
        config.connect_wait_timeout =
            parse_env_u64("KEYBRIDGE_CONNECT_WAIT_SECS")?.map(Duration::from_secs);

        Ok(config)
    }

    /// The approval-queue slice of this configuration.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            decision_timeout: self.decision_timeout,
            connect_wait_timeout: self.connect_wait_timeout,
            ..QueueConfig::default()
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match read_env(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("not a number: {raw}"),
            }),
    }
}
