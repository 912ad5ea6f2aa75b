use thiserror::Error;

use crate::core::MessageId;

/// The full error taxonomy for the queue engine.
///
/// Producer-visible variants (`Capacity`, `NotFound`, `InvalidState`,
/// `ConfigurationInvalid`) are meant to be matched on by callers. The rest are
/// recovered locally by the dispatcher/recovery paths and only surface here so
/// that internal plumbing has a single error type to propagate with `?`.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("buffer is at capacity")]
    Capacity,

    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("deduplication key '{0}' not found")]
    KeyNotFound(String),

    #[error("operation invalid for current state: {0}")]
    InvalidState(String),

    #[error("retries exhausted for message {0}")]
    RetriesExhausted(MessageId),

    #[error("handler timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("persistence corruption: {0}")]
    PersistenceCorruption(String),

    #[error("persistence I/O error: {0}")]
    PersistenceIo(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::InvalidState(format!("lock poisoned: {err}"))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for QueueError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for QueueError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
