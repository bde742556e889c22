//! Error types for relay-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// Backing log or store could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Input or logged record that cannot be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("job queue is full")]
    QueueFull,

    #[error("job queue is closed")]
    QueueClosed,

    #[error("worker pool has not been started")]
    PoolNotStarted,

    #[error("publisher is closed")]
    PublisherClosed,

    #[error("partition {0} is already claimed by a subscriber")]
    PartitionClaimed(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transport-level failure talking to the log or the store.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_) | Error::Database(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
