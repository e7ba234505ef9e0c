//! Versioned session snapshots stored inside checkpoints.
//!
//! A snapshot is either a full capture of session state or a delta against a
//! parent checkpoint. Both carry an explicit `schema` tag. Records written
//! before the tag existed (plain string-keyed maps) are migrated into
//! [`SessionStateV1`] on read, with missing or mistyped fields defaulted.
//!
//! Migration path:
//!
//! | Stored form                  | Decoded as                         |
//! |------------------------------|------------------------------------|
//! | `{"schema": "full/v1", ..}`  | `Full`, strict                     |
//! | `{"schema": "delta/v1", ..}` | `Delta`, strict                    |
//! | untagged / unknown map       | `Full` via [`SessionStateV1::from_open_map`] |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::session::{WorkflowSession, WorkflowStatus};

const FULL_V1: &str = "full/v1";
const DELTA_V1: &str = "delta/v1";

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Session state captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "schema")]
pub enum SessionSnapshot {
    #[serde(rename = "full/v1")]
    Full(SessionStateV1),
    #[serde(rename = "delta/v1")]
    Delta(SessionDeltaV1),
}

impl SessionSnapshot {
    /// Decode a stored snapshot value, migrating legacy maps.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(map) = value else {
            return Ok(SessionSnapshot::Full(SessionStateV1::from_open_map(
                &Map::new(),
            )));
        };

        match map.get("schema").and_then(Value::as_str) {
            Some(FULL_V1) => match serde_json::from_value(Value::Object(map.clone())) {
                Ok(state) => Ok(SessionSnapshot::Full(state)),
                Err(_) => Ok(SessionSnapshot::Full(SessionStateV1::from_open_map(&map))),
            },
            Some(DELTA_V1) => {
                serde_json::from_value(Value::Object(map)).map(SessionSnapshot::Delta)
            }
            _ => Ok(SessionSnapshot::Full(SessionStateV1::from_open_map(&map))),
        }
    }

    /// Whether this snapshot is a delta against a parent.
    pub fn is_delta(&self) -> bool {
        matches!(self, SessionSnapshot::Delta(_))
    }

    /// Parent checkpoint id for deltas.
    pub fn parent_checkpoint(&self) -> Option<&str> {
        match self {
            SessionSnapshot::Full(_) => None,
            SessionSnapshot::Delta(delta) => Some(delta.parent_checkpoint.as_str()),
        }
    }

    /// Session id recorded in the snapshot, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionSnapshot::Full(state) => Some(state.session_id.as_str()),
            SessionSnapshot::Delta(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for SessionSnapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        SessionSnapshot::from_value(value).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Full state
// ─────────────────────────────────────────────────────────────────────────────

/// Full session state, schema version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStateV1 {
    pub session_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub completed_stages: Vec<String>,
    #[serde(default)]
    pub failed_stages: Vec<String>,
    #[serde(default)]
    pub skipped_stages: Vec<String>,
    #[serde(default)]
    pub shared_context: Map<String, Value>,
    #[serde(default)]
    pub resource_bindings: BTreeMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionStateV1 {
    /// Capture the state of a live session.
    pub fn capture(session: &WorkflowSession) -> Self {
        Self {
            session_id: session.id.clone(),
            workflow_id: session.workflow_id.clone(),
            workflow_name: session.workflow_name.clone(),
            status: session.status,
            current_stage: session.current_stage.clone(),
            completed_stages: session.completed_stages.clone(),
            failed_stages: session.failed_stages.clone(),
            skipped_stages: session.skipped_stages.clone(),
            shared_context: session.shared_context.clone(),
            resource_bindings: session.resource_bindings.clone(),
            start_time: session.start_time,
            last_activity: session.last_activity,
        }
    }

    /// Build state from an untyped map, defaulting anything missing or mistyped.
    ///
    /// An absent status becomes `pending`; absent timestamps become now.
    pub fn from_open_map(map: &Map<String, Value>) -> Self {
        let now = Utc::now();
        let string = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let stages = |key: &str| -> Vec<String> {
            map.get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let time = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now)
        };

        let status = map
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let current_stage = map
            .get("current_stage")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let resource_bindings = map
            .get("resource_bindings")
            .and_then(Value::as_object)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let shared_context = map
            .get("shared_context")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Self {
            session_id: string("session_id"),
            workflow_id: string("workflow_id"),
            workflow_name: string("workflow_name"),
            status,
            current_stage,
            completed_stages: stages("completed_stages"),
            failed_stages: stages("failed_stages"),
            skipped_stages: stages("skipped_stages"),
            shared_context,
            resource_bindings,
            start_time: time("start_time"),
            last_activity: time("last_activity"),
        }
    }

    /// Apply a delta on top of this state.
    pub fn apply(&mut self, delta: &SessionDeltaV1) {
        if let Some(status) = delta.status {
            self.status = status;
        }
        match &delta.current_stage {
            Some(StageChange::Set(stage)) => self.current_stage = Some(stage.clone()),
            Some(StageChange::Cleared) => self.current_stage = None,
            None => {}
        }

        for stage in &delta.retracted_stages {
            self.completed_stages.retain(|s| s != stage);
            self.failed_stages.retain(|s| s != stage);
            self.skipped_stages.retain(|s| s != stage);
        }
        extend_unique(&mut self.completed_stages, &delta.new_completed_stages);
        extend_unique(&mut self.failed_stages, &delta.new_failed_stages);
        extend_unique(&mut self.skipped_stages, &delta.new_skipped_stages);

        if let Some(context) = &delta.shared_context {
            self.shared_context = context.clone();
        }
        if let Some(bindings) = &delta.resource_bindings {
            self.resource_bindings = bindings.clone();
        }
        self.last_activity = delta.last_activity;
    }

    /// Turn the captured state back into a session.
    ///
    /// `created_at` is taken from the start time; `updated_at` from the
    /// checkpoint timestamp.
    pub fn into_session(
        self,
        stage_results: BTreeMap<String, Value>,
        updated_at: DateTime<Utc>,
    ) -> WorkflowSession {
        WorkflowSession {
            id: self.session_id,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            status: self.status,
            current_stage: self.current_stage,
            completed_stages: self.completed_stages,
            failed_stages: self.failed_stages,
            skipped_stages: self.skipped_stages,
            stage_results,
            shared_context: self.shared_context,
            resource_bindings: self.resource_bindings,
            start_time: self.start_time,
            last_activity: self.last_activity,
            created_at: self.start_time,
            updated_at,
            checkpoints: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delta
// ─────────────────────────────────────────────────────────────────────────────

/// Change to the current stage between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageChange {
    Set(String),
    Cleared,
}

/// Session changes since a parent checkpoint, schema version 1.
///
/// Only fields that differ from the parent are populated; `last_activity` is
/// always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDeltaV1 {
    pub parent_checkpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_completed_stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_failed_stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_skipped_stages: Vec<String>,
    /// Stages present in the parent's sets but no longer in the session's.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retracted_stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_bindings: Option<BTreeMap<String, String>>,
    pub last_activity: DateTime<Utc>,
}

impl SessionDeltaV1 {
    /// Compute the changes from `base` to `current`.
    pub fn between(
        parent_checkpoint: impl Into<String>,
        base: &SessionStateV1,
        current: &WorkflowSession,
    ) -> Self {
        let current_stage = if base.current_stage == current.current_stage {
            None
        } else {
            Some(match &current.current_stage {
                Some(stage) => StageChange::Set(stage.clone()),
                None => StageChange::Cleared,
            })
        };

        let mut retracted_stages = Vec::new();
        for (old, new) in [
            (&base.completed_stages, &current.completed_stages),
            (&base.failed_stages, &current.failed_stages),
            (&base.skipped_stages, &current.skipped_stages),
        ] {
            for stage in difference(old, new) {
                if !retracted_stages.contains(&stage) {
                    retracted_stages.push(stage);
                }
            }
        }

        Self {
            parent_checkpoint: parent_checkpoint.into(),
            status: (base.status != current.status).then_some(current.status),
            current_stage,
            new_completed_stages: difference(&current.completed_stages, &base.completed_stages),
            new_failed_stages: difference(&current.failed_stages, &base.failed_stages),
            new_skipped_stages: difference(&current.skipped_stages, &base.skipped_stages),
            retracted_stages,
            shared_context: (base.shared_context != current.shared_context)
                .then(|| current.shared_context.clone()),
            resource_bindings: (base.resource_bindings != current.resource_bindings)
                .then(|| current.resource_bindings.clone()),
            last_activity: current.last_activity,
        }
    }
}

/// Items of `a` not present in `b`, in `a`'s order.
fn difference(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().filter(|s| !b.contains(s)).cloned().collect()
}

fn extend_unique(stages: &mut Vec<String>, additions: &[String]) {
    for stage in additions {
        if !stages.contains(stage) {
            stages.push(stage.clone());
        }
    }
}
