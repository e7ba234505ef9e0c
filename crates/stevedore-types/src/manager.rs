//! Session manager contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::WorkflowSession;

/// Source of live workflow sessions.
///
/// The checkpoint and coordination crates never own sessions; they read them
/// from and hand reconstructed ones back to a manager implementing this
/// trait.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Fetch the live session by id.
    ///
    /// Returns `SessionError::NotFound` when the id is unknown.
    async fn get_session(&self, session_id: &str) -> Result<WorkflowSession>;

    /// Store a session, replacing any existing session with the same id.
    async fn update_session(&self, session: WorkflowSession) -> Result<()>;

    /// Remove a session. Returns whether it existed.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;
}

/// Shared handle to a session manager.
pub type SharedSessionManager = Arc<dyn SessionManager>;
