//! Error taxonomy for the ingestion engine
//!
//! Every variant is fatal for the run that raised it. The only conditions the
//! engine recovers from locally are a full queue (drain and retry) and a
//! concurrent "table already exists" race, neither of which surfaces here.

use thiserror::Error;

use crate::sink::SinkError;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Key does not match its schema: missing field, wrong type, bad token
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Binary key is truncated or malformed for the schema it is read with
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// A bounded queue rejected an item even after a forced drain
    #[error("Queue saturated: capacity {capacity} still full after drain")]
    QueueSaturation { capacity: usize },

    /// Staging backend transaction, commit or cursor failure
    #[error("Staging I/O error: {0}")]
    StagingIo(String),

    /// Failure surfaced by the sink's buffer or publish call
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Tokenizer error: {0}")]
    Tokenize(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] regroup_common::CommonError),

    /// A worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Task(String),
}

impl IngestError {
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding(message.into())
    }

    pub fn staging(message: impl Into<String>) -> Self {
        Self::StagingIo(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<heed::Error> for IngestError {
    fn from(err: heed::Error) -> Self {
        Self::StagingIo(format!("lmdb: {}", err))
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::StagingIo(format!("postgres: {}", err))
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        Self::Tokenize(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
