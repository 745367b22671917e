//! Error types for robot communication and script execution

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RobotError>;

#[derive(Error, Debug)]
pub enum RobotError {
    #[error("Connection to {address} timed out after {timeout_ms}ms")]
    ConnectionTimeout { address: String, timeout_ms: u64 },

    #[error("Connection to {address} failed: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Robot reported error condition: {0}")]
    RobotErrorCondition(String),

    #[error("Script '{script}' failed: {reason}")]
    ScriptExecution { script: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl RobotError {
    /// Whether the error came from reaching the robot rather than from the request itself
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            RobotError::ConnectionTimeout { .. } | RobotError::ConnectionFailed { .. }
        )
    }
}
