//! Structured failure descriptors produced by pipeline tools.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Failure severity.
///
/// Parsed case-insensitively; unknown values decode as `Medium`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        Severity::from(value.as_str())
    }
}

impl From<&str> for Severity {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure reported by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub code: String,
    /// Coarse category, e.g. `build` or `deploy`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Fine-grained free-form type used for classification and rule matching.
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub retryable: bool,
    #[serde(rename = "stage_name", default)]
    pub stage: String,
    #[serde(rename = "tool_name", default)]
    pub tool: String,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowError {
    /// Create a failure for `tool` with a fresh id.
    pub fn new(tool: impl Into<String>, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message: message.into(),
            code: String::new(),
            kind: String::new(),
            error_type: error_type.into(),
            severity: Severity::Medium,
            retryable: true,
            stage: String::new(),
            tool: tool.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Event payload fields for rule evaluation.
    pub fn to_event_data(&self) -> Map<String, Value> {
        let value = json!({
            "error_id": self.id,
            "message": self.message,
            "code": self.code,
            "type": self.kind,
            "error_type": self.error_type,
            "severity": self.severity.as_str(),
            "retryable": self.retryable,
            "stage_name": self.stage,
            "tool_name": self.tool,
        });
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.tool, self.error_type, self.message)
    }
}
