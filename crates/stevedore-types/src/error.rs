//! Error types for session transitions and session manager backends.

/// Error type for workflow session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Session was not found by the session manager.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// A stage transition was attempted on a session in a terminal state.
    #[error("Cannot {action} stage '{stage}' in session {session_id}: session is {status}")]
    InvalidTransition {
        session_id: String,
        stage: String,
        action: &'static str,
        status: String,
    },

    /// The session violates one of its structural invariants.
    #[error("Session {session_id} is inconsistent: {reason}")]
    Inconsistent { session_id: String, reason: String },

    /// Error from the session manager backend.
    #[error("Session backend error: {0}")]
    Backend(String),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
