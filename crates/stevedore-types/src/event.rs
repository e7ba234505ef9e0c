//! Tool events and inter-tool messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::failure::WorkflowError;

/// Event type emitted when a tool reports a failure.
pub const FAILURE_EVENT: &str = "tool_failed";

/// Where a rule condition looks up its field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionScope {
    /// Event output first, then context.
    #[default]
    Any,
    /// The event's structured output (`data`).
    Output,
    /// The event's context map.
    Context,
    /// The `metrics` object inside the event's context.
    Metric,
}

/// Something a tool reported: a completion, a failure, a scan finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub source_tool: String,
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ToolEvent {
    pub fn new(source_tool: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            source_tool: source_tool.into(),
            event_type: event_type.into(),
            data,
            context: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build a `tool_failed` event from a failure descriptor.
    pub fn from_failure(failure: &WorkflowError, context: Map<String, Value>) -> Self {
        Self {
            source_tool: failure.tool.clone(),
            event_type: FAILURE_EVENT.to_string(),
            data: Value::Object(failure.to_event_data()),
            context,
            timestamp: failure.timestamp,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Set a numeric or structured metric under `context.metrics`.
    pub fn with_metric(mut self, key: impl Into<String>, value: Value) -> Self {
        let metrics = self
            .context
            .entry("metrics")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metrics.is_object() {
            *metrics = Value::Object(Map::new());
        }
        if let Value::Object(metrics) = metrics {
            metrics.insert(key.into(), value);
        }
        self
    }

    /// Look up a field in the given scope.
    pub fn lookup(&self, field: &str, scope: ConditionScope) -> Option<&Value> {
        match scope {
            ConditionScope::Output => self.data.get(field),
            ConditionScope::Context => self.context.get(field),
            ConditionScope::Metric => self.context.get("metrics").and_then(|m| m.get(field)),
            ConditionScope::Any => self.data.get(field).or_else(|| self.context.get(field)),
        }
    }

    /// Session id carried in the context, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.context.get("session_id").and_then(Value::as_str)
    }
}

/// A message dispatched from one tool to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Value,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Id of the coordination this message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
}

impl ToolMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            from: from.into(),
            to: to.into(),
            message_type: message_type.into(),
            payload,
            context: Map::new(),
            timestamp: Utc::now(),
            reply_to: None,
            correlation: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }
}
