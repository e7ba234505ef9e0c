//! Checkpoint records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::snapshot::SessionSnapshot;

/// Reference to the workflow definition in force when a checkpoint was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpecRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl WorkflowSpecRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Immutable point-in-time snapshot of a workflow session.
///
/// For incremental checkpoints `session_state` is a delta and `stage_results`
/// holds only the stages whose result changed since the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub id: String,
    pub stage_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub workflow_spec: Option<WorkflowSpecRef>,
    pub session_state: SessionSnapshot,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stage_results: BTreeMap<String, Value>,
    #[serde(default)]
    pub message: String,
}

impl WorkflowCheckpoint {
    /// Whether this checkpoint stores a delta against a parent.
    pub fn is_incremental(&self) -> bool {
        self.session_state.is_delta()
    }

    /// Parent checkpoint id for incremental checkpoints.
    pub fn parent_id(&self) -> Option<&str> {
        self.session_state.parent_checkpoint()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
