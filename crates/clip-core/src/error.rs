//! Core error types for Clip RS

use std::time::Duration;
use thiserror::Error;

/// Returned instead of running the operation while a circuit is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit '{resource}' is open, next attempt allowed in {retry_after:?}")]
pub struct CircuitOpen {
    /// Resource the breaker protects
    pub resource: String,
    /// Time left until the breaker lets a probe call through
    pub retry_after: Duration,
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
