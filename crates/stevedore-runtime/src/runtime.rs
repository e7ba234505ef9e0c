//! The workflow runtime: sessions, checkpoints and failure handling in one
//! place.
//!
//! ```text
//!   stage fails ──▶ handle_stage_failure ──▶ ToolCoordinator::handle_failure
//!                        │                        (classify, route, hand off)
//!                        ▼
//!                 SessionManager ◀──── checkpoint / resume ────▶ CheckpointStore
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use stevedore_checkpoint::CheckpointStore;
use stevedore_config::StevedoreConfig;
use stevedore_coordination::{
    CommunicationBridge, FailureOutcome, ToolCapability, ToolCoordinator,
};
use stevedore_types::{
    SharedSessionManager, WorkflowCheckpoint, WorkflowError, WorkflowSession, WorkflowSpecRef,
    WorkflowStatus,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::settings;

/// Shared-context key holding the latest escalation of a session.
pub const LAST_ESCALATION_KEY: &str = "last_escalation";

/// Shared-context key holding the failure that stopped a session.
pub const FATAL_FAILURE_KEY: &str = "fatal_failure";

/// Default interval between checkpoint expiry passes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Connects a session manager to a checkpoint store and a tool coordinator.
pub struct WorkflowRuntime {
    store: Arc<CheckpointStore>,
    coordinator: Arc<ToolCoordinator>,
    sessions: SharedSessionManager,
    incremental: bool,
    max_age: Option<Duration>,
    cleanup_interval: Duration,
}

impl std::fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntime")
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .field("incremental", &self.incremental)
            .field("max_age", &self.max_age)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish_non_exhaustive()
    }
}

impl WorkflowRuntime {
    /// Full checkpoints, no expiry.
    pub fn new(
        store: Arc<CheckpointStore>,
        coordinator: Arc<ToolCoordinator>,
        sessions: SharedSessionManager,
    ) -> Self {
        Self {
            store,
            coordinator,
            sessions,
            incremental: false,
            max_age: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Build a runtime from configuration.
    ///
    /// Opens the configured SQLite database, or an in-memory one when none
    /// is set. Call inside a Tokio runtime so coordination metrics get their
    /// background worker.
    pub fn from_config(
        config: &StevedoreConfig,
        bridge: Arc<dyn CommunicationBridge>,
        sessions: SharedSessionManager,
    ) -> Result<Self> {
        config.validate()?;

        let checkpoint = config.checkpoint();
        let escalation = config.escalation();

        let options = settings::checkpoint_options(&checkpoint);
        let store = match &checkpoint.database {
            Some(path) => CheckpointStore::open(path, options)?,
            None => CheckpointStore::open_in_memory(options)?,
        };

        let coordinator = ToolCoordinator::new(
            bridge,
            settings::coordination_config(&config.coordination(), &escalation),
        )
        .with_router(Arc::new(settings::escalation_router(&escalation)));

        info!(
            database = ?checkpoint.database,
            incremental = checkpoint.incremental,
            max_age_secs = ?checkpoint.max_age_secs,
            escalation_enabled = escalation.enabled,
            "Workflow runtime configured"
        );

        Ok(Self::new(Arc::new(store), Arc::new(coordinator), sessions)
            .with_incremental(checkpoint.incremental)
            .with_expiry(
                checkpoint.max_age_secs.map(Duration::from_secs),
                Duration::from_secs(checkpoint.cleanup_interval_secs),
            ))
    }

    /// Write incremental checkpoints once a session has a full one.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Expire checkpoints older than `max_age`, checking every `interval`.
    pub fn with_expiry(mut self, max_age: Option<Duration>, interval: Duration) -> Self {
        self.max_age = max_age;
        self.cleanup_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<ToolCoordinator> {
        &self.coordinator
    }

    pub fn sessions(&self) -> &SharedSessionManager {
        &self.sessions
    }

    /// Register tools with the coordinator.
    pub fn register_tools(&self, tools: impl IntoIterator<Item = ToolCapability>) {
        for tool in tools {
            self.coordinator.register_tool(tool);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checkpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot a live session and record the checkpoint on it.
    pub async fn checkpoint(
        &self,
        session_id: &str,
        stage_name: &str,
        message: &str,
        spec: Option<&WorkflowSpecRef>,
    ) -> Result<WorkflowCheckpoint> {
        let mut session = self.sessions.get_session(session_id).await?;

        let checkpoint = if self.incremental {
            self.store
                .create_incremental_checkpoint(&session, stage_name, message, spec)?
        } else {
            self.store
                .create_checkpoint(&session, stage_name, message, spec)?
        };

        session.checkpoints.push(checkpoint.id.clone());
        self.sessions.update_session(session).await?;

        debug!(
            session_id,
            checkpoint_id = %checkpoint.id,
            incremental = checkpoint.is_incremental(),
            "Session checkpointed"
        );
        Ok(checkpoint)
    }

    /// Rebuild a session from its most recent restorable checkpoint and hand
    /// it to the session manager.
    pub async fn resume(&self, session_id: &str) -> Result<WorkflowSession> {
        let session = self.store.restore_latest(session_id)?;
        let checkpoint_id = session.checkpoints.last().cloned().unwrap_or_default();
        self.install(session, &checkpoint_id).await
    }

    /// Rebuild a session from a specific checkpoint.
    pub async fn restore(&self, session_id: &str, checkpoint_id: &str) -> Result<WorkflowSession> {
        let session = self.store.restore_from_checkpoint(session_id, checkpoint_id)?;
        self.install(session, checkpoint_id).await
    }

    async fn install(&self, session: WorkflowSession, checkpoint_id: &str) -> Result<WorkflowSession> {
        session.check_invariants()?;
        self.sessions.update_session(session.clone()).await?;

        info!(
            session_id = %session.id,
            checkpoint_id,
            status = %session.status,
            current_stage = ?session.current_stage,
            "Session resumed"
        );
        Ok(session)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Failures
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a stage failure on the session and let the coordinator decide
    /// what happens next.
    ///
    /// The failed stage is taken from the failure, falling back to the
    /// session's current stage. A fatal or aborting outcome marks the
    /// session failed and drops its routing history. The session is stored
    /// even when coordination errors.
    pub async fn handle_stage_failure(
        &self,
        session_id: &str,
        failure: &WorkflowError,
        cancel: &CancellationToken,
    ) -> Result<FailureOutcome> {
        let mut session = self.sessions.get_session(session_id).await?;

        let stage = if failure.stage.is_empty() {
            session.current_stage.clone()
        } else {
            Some(failure.stage.clone())
        };
        if let Some(stage) = &stage {
            session.fail_stage(stage.as_str())?;
        }

        let mut context = session.shared_context.clone();
        context.insert("session_id".to_string(), json!(session.id));
        context.insert("workflow_id".to_string(), json!(session.workflow_id));
        if let Some(stage) = &stage {
            context.insert("stage".to_string(), json!(stage));
        }

        let outcome = match self.coordinator.handle_failure(failure, context, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    session_id,
                    source_tool = %failure.tool,
                    error = %e,
                    "Failure handling did not complete"
                );
                self.sessions.update_session(session).await?;
                return Err(e.into());
            }
        };

        match &outcome {
            FailureOutcome::Fatal { .. } | FailureOutcome::Aborted { .. } => {
                warn!(
                    session_id,
                    source_tool = %failure.tool,
                    error_type = %failure.error_type,
                    "Workflow stopped by failure"
                );
                session.set_context(FATAL_FAILURE_KEY, json!(failure));
                session.finish(WorkflowStatus::Failed);
                self.coordinator.router().clear_history(session_id);
            }
            FailureOutcome::Redirected {
                rule_id,
                target_tool,
                parameters,
                result,
                ..
            } => {
                session.set_context(
                    LAST_ESCALATION_KEY,
                    json!({
                        "rule_id": rule_id,
                        "source_tool": failure.tool,
                        "target_tool": target_tool,
                        "parameters": parameters,
                        "success": result.success,
                        "error": result.error,
                    }),
                );
            }
            FailureOutcome::Retry { .. } | FailureOutcome::Unhandled => {}
        }

        self.sessions.update_session(session).await?;
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expiry
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the periodic checkpoint expiry task.
    ///
    /// Returns `None` when no maximum age is configured. The first pass runs
    /// immediately; the task stops when `cancel` fires.
    pub fn spawn_expiry_task(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let max_age = self.max_age?;
        let store = Arc::clone(&self.store);
        let period = self.cleanup_interval.max(Duration::from_millis(1));

        info!(max_age = ?max_age, interval = ?period, "Starting checkpoint expiry task");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Checkpoint expiry task stopped");
                        break;
                    }
                    _ = ticker.tick() => match store.cleanup_expired_checkpoints(max_age) {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "Expired checkpoints removed"),
                        Err(e) => warn!(error = %e, "Checkpoint expiry pass failed"),
                    },
                }
            }
        }))
    }
}

/// Escalation details recorded on a session, if any.
pub fn last_escalation(session: &WorkflowSession) -> Option<&Value> {
    session.shared_context.get(LAST_ESCALATION_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionManager;
    use chrono::{TimeZone, Utc};
    use stevedore_checkpoint::{CheckpointOptions, ManualClock};
    use stevedore_coordination::{CoordinationConfig, InMemoryBridge, RoutingRule, RuleAction};
    use stevedore_types::{SessionError, Severity, ToolEvent};

    fn runtime_with(store: CheckpointStore) -> WorkflowRuntime {
        let coordinator = ToolCoordinator::new(
            Arc::new(InMemoryBridge::new()),
            CoordinationConfig::default(),
        );
        WorkflowRuntime::new(
            Arc::new(store),
            Arc::new(coordinator),
            Arc::new(InMemorySessionManager::new()),
        )
    }

    fn runtime() -> WorkflowRuntime {
        runtime_with(CheckpointStore::open_in_memory(CheckpointOptions::default()).unwrap())
    }

    async fn running_session(runtime: &WorkflowRuntime, id: &str) {
        let mut session = WorkflowSession::with_id(id, "containerize", "Containerize app");
        session.start_stage("analyze").unwrap();
        session
            .complete_stage("analyze", json!({ "language": "go" }))
            .unwrap();
        session.start_stage("build").unwrap();
        runtime.sessions().update_session(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_records_id_on_session() {
        let runtime = runtime();
        running_session(&runtime, "s-1").await;

        let checkpoint = runtime
            .checkpoint("s-1", "build", "before build", None)
            .await
            .unwrap();
        assert!(!checkpoint.is_incremental());

        let session = runtime.sessions().get_session("s-1").await.unwrap();
        assert_eq!(session.checkpoints, vec![checkpoint.id]);
    }

    #[tokio::test]
    async fn test_incremental_after_first_checkpoint() {
        let runtime = runtime().with_incremental(true);
        running_session(&runtime, "s-1").await;

        let first = runtime.checkpoint("s-1", "build", "", None).await.unwrap();
        assert!(!first.is_incremental());

        let mut session = runtime.sessions().get_session("s-1").await.unwrap();
        session
            .complete_stage("build", json!({ "image": "app:1" }))
            .unwrap();
        runtime.sessions().update_session(session).await.unwrap();

        let second = runtime.checkpoint("s-1", "build", "", None).await.unwrap();
        assert_eq!(second.parent_id(), Some(first.id.as_str()));
    }

    #[tokio::test]
    async fn test_checkpoint_unknown_session() {
        let err = runtime()
            .checkpoint("missing", "build", "", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::RuntimeError::Session(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fatal_failure_fails_session() {
        let runtime = runtime();
        running_session(&runtime, "s-1").await;

        let failure = WorkflowError::new("build_image", "registry_permission_denied", "denied");
        let outcome = runtime
            .handle_stage_failure("s-1", &failure, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Fatal { .. }));

        let session = runtime.sessions().get_session("s-1").await.unwrap();
        assert_eq!(session.status, WorkflowStatus::Failed);
        assert_eq!(session.failed_stages, vec!["build"]);
        assert!(session.current_stage.is_none());
        assert_eq!(
            session.shared_context[FATAL_FAILURE_KEY]["error_type"],
            "registry_permission_denied"
        );
    }

    #[tokio::test]
    async fn test_aborted_session_drops_routing_history() {
        let runtime = runtime();
        let mut halt = RoutingRule::redirect("halt_on_push", "push_image", "");
        halt.action = RuleAction::Abort;
        halt.redirect_to = None;
        let router = runtime.coordinator().router();
        router.register_rule(halt);
        running_session(&runtime, "s-1").await;

        let failure = WorkflowError::new("push_image", "registry_timeout", "push stalled")
            .with_severity(Severity::Low);
        router.route(
            &ToolEvent::from_failure(&failure, serde_json::Map::new())
                .with_context("session_id", json!("s-1")),
        );
        assert_eq!(router.routing_history("s-1").len(), 1);

        let outcome = runtime
            .handle_stage_failure("s-1", &failure, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Aborted { ref rule_id } if rule_id == "halt_on_push"));
        assert!(router.routing_history("s-1").is_empty());
        assert_eq!(
            runtime.sessions().get_session("s-1").await.unwrap().status,
            WorkflowStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_unhandled_failure_keeps_session_running() {
        let runtime = runtime();
        running_session(&runtime, "s-1").await;

        let failure = WorkflowError::new("build_image", "network_timeout", "registry slow")
            .with_severity(Severity::Low)
            .with_stage("build");
        let outcome = runtime
            .handle_stage_failure("s-1", &failure, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Unhandled);

        let session = runtime.sessions().get_session("s-1").await.unwrap();
        assert_eq!(session.status, WorkflowStatus::Running);
        assert_eq!(session.failed_stages, vec!["build"]);
        assert!(last_escalation(&session).is_none());
    }

    #[tokio::test]
    async fn test_coordination_error_still_stores_failed_stage() {
        // Default rules redirect to generate_dockerfile, which is not registered.
        let runtime = runtime();
        running_session(&runtime, "s-1").await;

        let failure = WorkflowError::new("build_image", "docker_build_error", "bad Dockerfile");
        let err = runtime
            .handle_stage_failure("s-1", &failure, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::RuntimeError::Coordination(_)));

        let session = runtime.sessions().get_session("s-1").await.unwrap();
        assert_eq!(session.failed_stages, vec!["build"]);
    }

    #[test]
    fn test_no_expiry_task_without_max_age() {
        assert!(
            runtime()
                .spawn_expiry_task(CancellationToken::new())
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_task_removes_old_checkpoints() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = CheckpointStore::open_in_memory(CheckpointOptions::default())
            .unwrap()
            .with_clock(clock.clone());
        let runtime = runtime_with(store).with_expiry(
            Some(Duration::from_secs(3600)),
            Duration::from_secs(60),
        );
        running_session(&runtime, "s-1").await;

        runtime.checkpoint("s-1", "analyze", "", None).await.unwrap();
        clock.advance(chrono::Duration::hours(2));
        runtime.checkpoint("s-1", "build", "", None).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = runtime.spawn_expiry_task(cancel.clone()).unwrap();

        // The first pass runs immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = runtime.store().list_checkpoints("s-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stage_name, "build");

        // Later passes pick up checkpoints as they age.
        clock.advance(chrono::Duration::hours(2));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(runtime.store().list_checkpoints("s-1").unwrap().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
