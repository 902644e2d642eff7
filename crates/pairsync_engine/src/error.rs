//! Error types for the sync engine.

use crate::transport::LaneKind;
use pairsync_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Stale updates are not errors; they are a normal merge outcome.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The lane cannot be used right now.
    #[error("{lane} lane unavailable")]
    TransportUnavailable {
        /// The lane that was unusable.
        lane: LaneKind,
    },

    /// An envelope failed validation.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),

    /// The local store failed to commit.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A record without a stable id was submitted for sync.
    #[error("record has no stable id")]
    MissingRecordId,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds the directory lock.
    #[error("directory is locked by another process: {}", path.display())]
    Locked {
        /// The locked directory.
        path: PathBuf,
    },

    /// A lane exchange did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The peer end of an in-process lane was dropped.
    #[error("channel closed")]
    Closed,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Returns true if a later drain may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::TransportUnavailable { .. }
            | SyncError::Persistence(_)
            | SyncError::Timeout
            | SyncError::Closed
            | SyncError::Io(_) => true,
            SyncError::MalformedMessage(_) | SyncError::MissingRecordId | SyncError::Locked { .. } => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::Transport {
            message: "peer rejected".into(),
            retryable: false
        }
        .is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::persistence("disk full").is_retryable());
        assert!(SyncError::TransportUnavailable {
            lane: LaneKind::Ephemeral
        }
        .is_retryable());
        assert!(!SyncError::MissingRecordId.is_retryable());
        assert!(!SyncError::from(ProtocolError::MissingField { field: "startDate" }).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::TransportUnavailable {
            lane: LaneKind::Durable,
        };
        assert_eq!(err.to_string(), "durable lane unavailable");

        let err = SyncError::from(ProtocolError::MissingField { field: "updatedAt" });
        assert!(err.to_string().contains("updatedAt"));
    }
}
