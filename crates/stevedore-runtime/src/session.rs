//! In-process session manager.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use stevedore_types::{Result, SessionError, SessionManager, WorkflowSession};
use tracing::{debug, trace};

/// Keeps live sessions in a map.
///
/// Sessions are lost with the process; [`WorkflowRuntime::resume`](crate::WorkflowRuntime::resume)
/// brings them back from the checkpoint store.
#[derive(Debug, Default)]
pub struct InMemorySessionManager {
    sessions: RwLock<HashMap<String, WorkflowSession>>,
}

impl InMemorySessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Ids of all live sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    async fn get_session(&self, session_id: &str) -> Result<WorkflowSession> {
        trace!(session_id, "Session lookup");
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn update_session(&self, session: WorkflowSession) -> Result<()> {
        debug!(session_id = %session.id, status = %session.status, "Session stored");
        self.sessions.write().insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            debug!(session_id, "Session deleted");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud() {
        let manager = InMemorySessionManager::new();
        assert!(manager.is_empty());

        let session = WorkflowSession::with_id("s-1", "wf", "Containerize");
        manager.update_session(session.clone()).await.unwrap();
        assert_eq!(manager.get_session("s-1").await.unwrap(), session);

        let mut changed = session.clone();
        changed.start_stage("analyze").unwrap();
        manager.update_session(changed).await.unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.get_session("s-1").await.unwrap().current_stage.as_deref(),
            Some("analyze")
        );

        assert!(manager.delete_session("s-1").await.unwrap());
        assert!(!manager.delete_session("s-1").await.unwrap());
        assert!(matches!(
            manager.get_session("s-1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_ids_sorted() {
        let manager = InMemorySessionManager::new();
        for id in ["b", "c", "a"] {
            manager
                .update_session(WorkflowSession::with_id(id, "wf", "wf"))
                .await
                .unwrap();
        }
        assert_eq!(manager.session_ids(), vec!["a", "b", "c"]);
    }
}
