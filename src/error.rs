//! Error types for the relay.

use crate::types::QueueId;
use thiserror::Error;

/// Main error type for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The queue is unknown or was expired; the client must register again.
    #[error("Queue expired or not found: {0}")]
    QueueExpired(QueueId),

    /// The bus could not accept the event. Callers treat this as non-fatal.
    #[error("Event bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("A poll is already pending for queue {0}")]
    DuplicatePoll(QueueId),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl RelayError {
    /// True when the client should re-register instead of retrying.
    pub fn requires_registration(&self) -> bool {
        matches!(self, RelayError::QueueExpired(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(e: toml::de::Error) -> Self {
        RelayError::InvalidConfig(e.to_string())
    }
}

#[cfg(feature = "redis-bus")]
impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        RelayError::BusUnavailable(e.to_string())
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
