//! Configuration loading for the robot link and execution queue

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::{Result, RobotError};

/// UR dashboard server, accepts `load <program>`, `play` and `stop`
pub const DEFAULT_COMMAND_PORT: u16 = 29999;
/// UR secondary client interface
pub const DEFAULT_STATUS_PORT: u16 = 30002;
/// Bound on every connection attempt, in seconds
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 2.0;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub robot: RobotConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    pub host: String,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortConfig {
    pub status: u16,
    pub command: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub timeout: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Drop an entry whose program never reports completion. Unset means wait forever.
    pub finish_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    pub event_id: Option<u32>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            status: DEFAULT_STATUS_PORT,
            command: DEFAULT_COMMAND_PORT,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Config {
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| RobotError::Config(format!("Failed to read {}: {}", config_path, e)))?;

        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal config pointing at `host` with default ports and timeouts
    pub fn for_host(host: &str) -> Self {
        Self {
            robot: RobotConfig {
                host: host.to_string(),
                ports: PortConfig::default(),
                connection: ConnectionConfig::default(),
            },
            queue: QueueConfig::default(),
            catalog: CatalogConfig::default(),
            session: SessionConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(RobotError::Config("robot.host must not be empty".to_string()));
        }
        if self.robot.ports.status == self.robot.ports.command {
            return Err(RobotError::Config(format!(
                "status and command ports must differ (both {})",
                self.robot.ports.status
            )));
        }
        let timeout = self.robot.connection.timeout;
        if !(timeout > 0.0 && Duration::try_from_secs_f64(timeout).is_ok()) {
            return Err(RobotError::Config(format!(
                "robot.connection.timeout must be a positive number of seconds, got {}",
                timeout
            )));
        }
        Ok(())
    }

    /// `host:port` of the status feed
    pub fn status_address(&self) -> String {
        format!("{}:{}", self.robot.host, self.robot.ports.status)
    }

    /// `host:port` of the command endpoint
    pub fn command_address(&self) -> String {
        format!("{}:{}", self.robot.host, self.robot.ports.command)
    }

    /// Connect bound for both channels; values `validate` would reject fall back to the default
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.robot.connection.timeout)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT))
    }
}

impl QueueConfig {
    pub fn finish_timeout(&self) -> Option<Duration> {
        self.finish_timeout_seconds.map(Duration::from_secs)
    }
}
