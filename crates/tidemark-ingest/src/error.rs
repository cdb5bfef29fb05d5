//! Error types for the indexing engine.

use crate::subscription::StreamMessage;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while consuming and indexing the stream.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Shared vocabulary error (URI parsing, op actions).
    #[error(transparent)]
    Core(#[from] tidemark_core::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An inbound message failed schema validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A frame or record payload could not be decoded or resolved.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A record does not match the shape its collection requires.
    #[error("Invalid {collection} record: {reason}")]
    InvalidRecord { collection: String, reason: String },

    /// Stored index state is inconsistent.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The subscription lease was lost or could not be managed.
    #[error("Leadership error: {0}")]
    Leadership(String),

    /// Transport failure, upstream error frame or disconnect.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Work was aborted by cancellation.
    #[error("Cancelled")]
    Cancelled,

    /// A blocking task panicked or was aborted.
    #[error("Task error: {0}")]
    Task(String),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Failure while handling one stream message, with its context.
    #[error("Processing error at seq {seq} (repo {repo}, commit {commit}, time {time}): {source}")]
    Processing {
        seq: i64,
        repo: String,
        commit: String,
        time: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap `err` with the context of the message being handled.
    pub fn processing(msg: &StreamMessage, err: Error) -> Self {
        Error::Processing {
            seq: msg.seq,
            repo: msg.repo.clone(),
            commit: msg.commit.to_string(),
            time: msg.time.clone(),
            source: Box::new(err),
        }
    }

    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::Core(_) | Error::Decode(_) => "decode",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
            Error::Validation(_) => "validation",
            Error::InvalidRecord { .. } => "invalid_record",
            Error::Integrity(_) => "integrity",
            Error::Leadership(_) => "leadership",
            Error::Connection(_) => "connection",
            Error::Cancelled => "cancelled",
            Error::Task(_) => "task",
            Error::ChannelSend(_) => "channel",
            Error::Processing { source, .. } => source.kind(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Processing { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_kind_uses_source() {
        let err = Error::Processing {
            seq: 7,
            repo: "did:plc:bob".to_string(),
            commit: "bafy".to_string(),
            time: "2024-01-01T00:00:00Z".to_string(),
            source: Box::new(Error::Decode("missing block".to_string())),
        };
        assert_eq!(err.kind(), "decode");
        let msg = err.to_string();
        assert!(msg.contains("seq 7"));
        assert!(msg.contains("did:plc:bob"));
        assert!(msg.contains("missing block"));
    }

    #[test]
    fn test_is_cancelled_through_processing() {
        let err = Error::Processing {
            seq: 1,
            repo: String::new(),
            commit: String::new(),
            time: String::new(),
            source: Box::new(Error::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!Error::Leadership("lost".to_string()).is_cancelled());
    }
}
