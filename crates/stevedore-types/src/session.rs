//! Workflow sessions: one pipeline run and its accumulated state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, SessionError};

/// Lifecycle status of a workflow session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further stages may start.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" | "canceled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// One end-to-end pipeline run.
///
/// Mutated only through the stage-transition methods, which keep
/// `current_stage` out of `completed_stages` at all times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub failed_stages: Vec<String>,
    pub skipped_stages: Vec<String>,
    /// Structured result per stage name.
    pub stage_results: BTreeMap<String, Value>,
    /// Cross-stage variables.
    pub shared_context: Map<String, Value>,
    /// Produced resources, e.g. `image_ref -> registry/app:1.2`.
    pub resource_bindings: BTreeMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Checkpoint ids in the order they were taken.
    #[serde(default)]
    pub checkpoints: Vec<String>,
}

impl WorkflowSession {
    /// Create a new pending session with a fresh id.
    pub fn new(workflow_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), workflow_id, workflow_name)
    }

    /// Create a new pending session with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            status: WorkflowStatus::Pending,
            current_stage: None,
            completed_stages: Vec::new(),
            failed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            stage_results: BTreeMap::new(),
            shared_context: Map::new(),
            resource_bindings: BTreeMap::new(),
            start_time: now,
            last_activity: now,
            created_at: now,
            updated_at: now,
            checkpoints: Vec::new(),
        }
    }

    /// Begin executing a stage.
    ///
    /// Re-running a stage that already completed or failed (for instance when
    /// a corrective tool is invoked again) removes it from those sets.
    pub fn start_stage(&mut self, stage: impl Into<String>) -> Result<()> {
        let stage = stage.into();
        self.ensure_active(&stage, "start")?;

        self.completed_stages.retain(|s| *s != stage);
        self.failed_stages.retain(|s| *s != stage);
        self.current_stage = Some(stage);
        self.status = WorkflowStatus::Running;
        self.touch();
        Ok(())
    }

    /// Record a stage as completed with its result.
    pub fn complete_stage(&mut self, stage: impl Into<String>, result: Value) -> Result<()> {
        let stage = stage.into();
        self.ensure_active(&stage, "complete")?;

        self.failed_stages.retain(|s| *s != stage);
        push_unique(&mut self.completed_stages, &stage);
        self.clear_current(&stage);
        self.stage_results.insert(stage, result);
        self.touch();
        Ok(())
    }

    /// Record a stage as failed.
    pub fn fail_stage(&mut self, stage: impl Into<String>) -> Result<()> {
        let stage = stage.into();
        self.ensure_active(&stage, "fail")?;

        push_unique(&mut self.failed_stages, &stage);
        self.clear_current(&stage);
        self.touch();
        Ok(())
    }

    /// Record a stage as skipped.
    pub fn skip_stage(&mut self, stage: impl Into<String>) -> Result<()> {
        let stage = stage.into();
        self.ensure_active(&stage, "skip")?;

        push_unique(&mut self.skipped_stages, &stage);
        self.clear_current(&stage);
        self.touch();
        Ok(())
    }

    /// Move the session into a final status and clear the current stage.
    pub fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.current_stage = None;
        self.touch();
    }

    /// Bind a produced resource (e.g. an image reference) to a name.
    pub fn bind_resource(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.resource_bindings.insert(name.into(), value.into());
        self.touch();
    }

    /// Set a shared context variable.
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.shared_context.insert(key.into(), value);
        self.touch();
    }

    /// Check that `current_stage` is not also listed as completed.
    pub fn check_invariants(&self) -> Result<()> {
        if let Some(current) = &self.current_stage
            && self.completed_stages.contains(current)
        {
            return Err(SessionError::Inconsistent {
                session_id: self.id.clone(),
                reason: format!("current stage '{current}' is also marked completed"),
            });
        }
        Ok(())
    }

    /// Update activity timestamps.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_activity = now;
        self.updated_at = now;
    }

    fn ensure_active(&self, stage: &str, action: &'static str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                session_id: self.id.clone(),
                stage: stage.to_string(),
                action,
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    fn clear_current(&mut self, stage: &str) {
        if self.current_stage.as_deref() == Some(stage) {
            self.current_stage = None;
        }
    }
}

fn push_unique(stages: &mut Vec<String>, stage: &str) {
    if !stages.iter().any(|s| s == stage) {
        stages.push(stage.to_string());
    }
}
