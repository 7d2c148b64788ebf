//! Error handling module

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH authentication failed: {0}")]
    Authentication(String),

    #[error("Router unreachable: {0}")]
    Unreachable(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl MonitorError {
    /// Errors that mean the SSH session can no longer be trusted
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            MonitorError::Authentication(_)
                | MonitorError::Unreachable(_)
                | MonitorError::HostKeyRejected(_)
        )
    }

    /// Short label used in cycle log lines
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Authentication(_)
            | MonitorError::Unreachable(_)
            | MonitorError::HostKeyRejected(_) => "connection",
            MonitorError::Read(_) => "read",
            MonitorError::Storage(_) => "storage",
        }
    }
}

impl From<sqlx::Error> for MonitorError {
    fn from(e: sqlx::Error) -> Self {
        MonitorError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
