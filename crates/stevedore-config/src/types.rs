//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [checkpoint]               # checkpoint store
//! [coordination]             # cross-tool coordination
//! [escalation]               # failure escalation
//! [escalation.retry.build_image]
//! [[escalation.rules]]
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StevedoreConfig {
    /// Checkpoint store configuration.
    pub checkpoint: Option<CheckpointSection>,

    /// Coordination engine configuration.
    pub coordination: Option<CoordinationSection>,

    /// Escalation router configuration.
    pub escalation: Option<EscalationSection>,
}

impl StevedoreConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: StevedoreConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale, except escalation rules and retry
    /// policies, which accumulate.
    pub fn merge(&mut self, other: StevedoreConfig) {
        if other.checkpoint.is_some() {
            self.checkpoint = other.checkpoint;
        }

        if other.coordination.is_some() {
            self.coordination = other.coordination;
        }

        match (self.escalation.as_mut(), other.escalation) {
            (Some(base), Some(layer)) => {
                base.enabled = layer.enabled;
                base.default_rules = layer.default_rules;
                for (class, policy) in layer.retry {
                    base.retry.insert(class, policy);
                }
                base.rules.extend(layer.rules);
            }
            (None, Some(layer)) => self.escalation = Some(layer),
            (_, None) => {}
        }
    }

    /// Checkpoint section, or defaults.
    pub fn checkpoint(&self) -> CheckpointSection {
        self.checkpoint.clone().unwrap_or_default()
    }

    /// Coordination section, or defaults.
    pub fn coordination(&self) -> CoordinationSection {
        self.coordination.clone().unwrap_or_default()
    }

    /// Escalation section, or defaults.
    pub fn escalation(&self) -> EscalationSection {
        self.escalation.clone().unwrap_or_default()
    }

    /// Reject values that parse but cannot be used.
    pub fn validate(&self) -> Result<()> {
        if let Some(cp) = &self.checkpoint {
            if !(1..=22).contains(&cp.compression_level) {
                return Err(invalid(
                    "checkpoint.compression_level",
                    format!("{} is outside 1..=22", cp.compression_level),
                ));
            }
            if cp.cleanup_interval_secs == 0 {
                return Err(invalid(
                    "checkpoint.cleanup_interval_secs",
                    "must be greater than zero",
                ));
            }
        }

        if let Some(coord) = &self.coordination {
            if coord.timeout_secs == 0 {
                return Err(invalid("coordination.timeout_secs", "must be greater than zero"));
            }
            if coord.metrics_queue_capacity == 0 {
                return Err(invalid(
                    "coordination.metrics_queue_capacity",
                    "must be greater than zero",
                ));
            }
        }

        if let Some(esc) = &self.escalation {
            for (class, policy) in &esc.retry {
                if policy.max_attempts == 0 {
                    return Err(invalid(
                        &format!("escalation.retry.{class}.max_attempts"),
                        "must be at least 1",
                    ));
                }
                if policy.max_delay_ms < policy.initial_delay_ms {
                    return Err(invalid(
                        &format!("escalation.retry.{class}.max_delay_ms"),
                        "must not be less than initial_delay_ms",
                    ));
                }
            }
            for rule in &esc.rules {
                if rule.source_tool.is_empty() || rule.id.is_empty() {
                    return Err(invalid(
                        "escalation.rules",
                        "every rule needs an id and a source_tool",
                    ));
                }
                if rule.action == RuleActionKind::Redirect && rule.redirect_to.is_none() {
                    return Err(invalid(
                        &format!("escalation.rules.{}.redirect_to", rule.id),
                        "redirect rules need a target tool",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checkpoint Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Payload compression mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    Zstd,
    None,
}

/// What to do when a restored checkpoint fails its checksum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicyKind {
    /// Log a warning and restore anyway.
    #[default]
    BestEffort,
    /// Refuse to restore.
    Strict,
}

/// Checkpoint store configuration.
///
/// ```toml
/// [checkpoint]
/// database = "checkpoints.db"
/// compression = "zstd"
/// restore_policy = "strict"
/// max_age_secs = 604800
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// Path to the SQLite database. In-memory when unset.
    pub database: Option<PathBuf>,
    pub compression: CompressionMode,
    /// zstd level.
    pub compression_level: i32,
    /// Write and verify SHA-256 checksums.
    pub integrity: bool,
    pub restore_policy: RestorePolicyKind,
    /// Prefer incremental checkpoints once a session has a full one.
    pub incremental: bool,
    /// Checkpoints older than this are removed by the expiry task.
    pub max_age_secs: Option<u64>,
    pub cleanup_interval_secs: u64,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            database: None,
            compression: CompressionMode::Zstd,
            compression_level: 3,
            integrity: true,
            restore_policy: RestorePolicyKind::BestEffort,
            incremental: true,
            max_age_secs: None,
            cleanup_interval_secs: 3600,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordination Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Coordination engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSection {
    /// How long a coordination waits for its target before timing out.
    pub timeout_secs: u64,
    /// Capacity of the metrics update queue.
    pub metrics_queue_capacity: usize,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            metrics_queue_capacity: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Escalation Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Escalation router configuration.
///
/// ```toml
/// [escalation]
/// enabled = true
///
/// [escalation.retry.escalated_build]
/// max_attempts = 2
/// backoff = "fixed"
/// initial_delay_ms = 5000
/// max_delay_ms = 5000
///
/// [[escalation.rules]]
/// id = "registry_auth"
/// source_tool = "push_image"
/// redirect_to = "configure_registry"
///
/// [[escalation.rules.conditions]]
/// field = "error_type"
/// operator = "contains"
/// value = "unauthorized"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSection {
    /// Master switch for redirecting failures to other tools.
    pub enabled: bool,
    /// Register the built-in rule set.
    pub default_rules: bool,
    /// Retry policy overrides keyed by tool name or escalation class.
    pub retry: BTreeMap<String, RetryPolicySection>,
    /// Additional routing rules.
    pub rules: Vec<RuleSection>,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rules: true,
            retry: BTreeMap::new(),
            rules: Vec::new(),
        }
    }
}

/// Backoff mode for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// A retry policy as written in config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicySection {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// What a matched rule asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleActionKind {
    #[default]
    Redirect,
    Retry,
    Abort,
}

/// A routing rule as written in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSection {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source_tool: String,
    pub action: RuleActionKind,
    pub redirect_to: Option<String>,
    pub priority: i32,
    pub enabled: bool,
    pub fix_errors: bool,
    /// Extra string parameters handed to the target tool.
    pub parameters: BTreeMap<String, String>,
    /// Retry policy class used when the rule's target is retried.
    pub retry_class: Option<String>,
    pub conditions: Vec<ConditionSection>,
}

impl Default for RuleSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            source_tool: String::new(),
            action: RuleActionKind::Redirect,
            redirect_to: None,
            priority: 0,
            enabled: true,
            fix_errors: true,
            parameters: BTreeMap::new(),
            retry_class: None,
            conditions: Vec::new(),
        }
    }
}

/// Comparison operator for a rule condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    #[default]
    Equals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
}

/// Where a condition looks up its field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    #[default]
    Any,
    Output,
    Context,
    Metric,
}

/// A rule condition as written in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionSection {
    pub field: String,
    pub operator: OperatorKind,
    pub value: Value,
    pub scope: ScopeKind,
}

impl Default for ConditionSection {
    fn default() -> Self {
        Self {
            field: String::new(),
            operator: OperatorKind::Equals,
            value: Value::Bool(true),
            scope: ScopeKind::Any,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
