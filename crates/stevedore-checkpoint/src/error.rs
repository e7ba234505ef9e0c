//! Error types for the checkpoint crate.

use thiserror::Error;

/// Errors that can occur in the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying database operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload could not be compressed or decompressed.
    #[error("Compression error for checkpoint {checkpoint_id}: {source}")]
    Compression {
        checkpoint_id: String,
        source: std::io::Error,
    },

    /// Stored checksum does not match the payload.
    #[error("Checksum mismatch for checkpoint {checkpoint_id}: expected {expected}, got {actual}")]
    Integrity {
        checkpoint_id: String,
        expected: String,
        actual: String,
    },

    /// Checkpoint does not exist.
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Session has no checkpoints.
    #[error("No checkpoints found for session {0}")]
    NoCheckpoints(String),

    /// An incremental checkpoint references a parent that no longer exists.
    #[error("Checkpoint {checkpoint_id} depends on missing parent {missing_parent}")]
    BrokenChain {
        checkpoint_id: String,
        missing_parent: String,
    },

    /// A stored record cannot be interpreted at all.
    #[error("Corrupt checkpoint record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl CheckpointError {
    /// Whether the error comes from a stored record that cannot be decoded
    /// or rebuilt, as opposed to the store itself failing.
    pub fn is_unreadable_record(&self) -> bool {
        matches!(
            self,
            Self::BrokenChain { .. }
                | Self::Corrupt { .. }
                | Self::Integrity { .. }
                | Self::Compression { .. }
                | Self::Serialization(_)
        )
    }
}

/// Result type alias for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;
