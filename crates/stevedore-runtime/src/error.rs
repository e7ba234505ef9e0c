//! Runtime error types.

use stevedore_checkpoint::CheckpointError;
use stevedore_config::ConfigError;
use stevedore_coordination::CoordinationError;
use stevedore_types::SessionError;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the workflow runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Checkpoint store failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Coordination or escalation failure.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Session manager or session transition failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
