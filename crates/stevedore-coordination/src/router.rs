//! Escalation router.
//!
//! Holds routing rules per source tool and retry policies per class. Routing
//! a failure event returns every enabled rule whose conditions all hold,
//! highest priority first. The router only decides; the
//! [`ToolCoordinator`](crate::ToolCoordinator) acts on the decision.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stevedore_types::ToolEvent;
use tracing::debug;

use crate::condition::{Condition, Operator, all_match};
use crate::retry::{DEFAULT_CLASS, RetryPolicy, default_policies};

/// Parameter naming the tool whose failure caused the escalation.
pub const PARAM_ESCALATION_SOURCE: &str = "escalation_source";
/// Parameter set to [`ESCALATION_MODE_AUTO`] on every escalated invocation.
pub const PARAM_ESCALATION_MODE: &str = "escalation_mode";
pub const PARAM_FIX_ERRORS: &str = "fix_errors";
pub const PARAM_ESCALATION_RULE: &str = "escalation_rule";
pub const ESCALATION_MODE_AUTO: &str = "auto";

/// Routing records kept per session.
pub const ROUTING_HISTORY_LIMIT: usize = 100;

/// Sessions with routing history kept before the least recently routed is
/// dropped.
pub const ROUTING_HISTORY_SESSIONS: usize = 1024;

/// What to do when a rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Hand the failure to a corrective tool.
    #[default]
    Redirect,
    /// Re-run the failing tool under the rule's retry policy.
    Retry,
    /// Stop the workflow.
    Abort,
}

/// A rule applied to failures from one source tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_tool: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default)]
    pub redirect_to: Option<String>,
    /// Retry policy class for the escalated operation.
    #[serde(default)]
    pub retry_class: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub fix_errors: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RoutingRule {
    /// Rule redirecting failures of `source_tool` to `target_tool`.
    pub fn redirect(
        id: impl Into<String>,
        source_tool: impl Into<String>,
        target_tool: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            source_tool: source_tool.into(),
            conditions: Vec::new(),
            action: RuleAction::Redirect,
            redirect_to: Some(target_tool.into()),
            retry_class: None,
            parameters: BTreeMap::new(),
            fix_errors: true,
            priority: 0,
            enabled: true,
        }
    }

    /// Rule retrying `source_tool` under the given policy class.
    pub fn retry(
        id: impl Into<String>,
        source_tool: impl Into<String>,
        retry_class: impl Into<String>,
    ) -> Self {
        let mut rule = Self::redirect(id, source_tool, "");
        rule.action = RuleAction::Retry;
        rule.redirect_to = None;
        rule.retry_class = Some(retry_class.into());
        rule
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_class(mut self, class: impl Into<String>) -> Self {
        self.retry_class = Some(class.into());
        self
    }

    pub fn with_fix_errors(mut self, fix_errors: bool) -> Self {
        self.fix_errors = fix_errors;
        self
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = action;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Flat parameter bag handed to the target tool.
    fn escalation_parameters(&self) -> BTreeMap<String, String> {
        let mut params = self.parameters.clone();
        params.insert(PARAM_ESCALATION_SOURCE.to_string(), self.source_tool.clone());
        params.insert(
            PARAM_ESCALATION_MODE.to_string(),
            ESCALATION_MODE_AUTO.to_string(),
        );
        params.insert(PARAM_FIX_ERRORS.to_string(), self.fix_errors.to_string());
        params.insert(PARAM_ESCALATION_RULE.to_string(), self.id.clone());
        params
    }
}

/// A rule that matched an event, ready to act on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedRule {
    pub rule_id: String,
    pub source_tool: String,
    pub action: RuleAction,
    pub target_tool: Option<String>,
    pub priority: i32,
    pub parameters: BTreeMap<String, String>,
    pub retry_policy: RetryPolicy,
}

/// One routing decision, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingRecord {
    pub timestamp: DateTime<Utc>,
    pub source_tool: String,
    pub event_type: String,
    pub matched_rules: Vec<String>,
    pub target_tool: Option<String>,
}

/// Rule-based router for tool failures.
#[derive(Debug)]
pub struct EscalationRouter {
    rules: RwLock<HashMap<String, Vec<RoutingRule>>>,
    retry_policies: RwLock<BTreeMap<String, RetryPolicy>>,
    history: RwLock<LruCache<String, VecDeque<RoutingRecord>>>,
}

impl Default for EscalationRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationRouter {
    /// An empty router with no rules or retry policies.
    pub fn new() -> Self {
        Self {
            rules: RwLock::default(),
            retry_policies: RwLock::default(),
            history: RwLock::new(LruCache::new(history_capacity(ROUTING_HISTORY_SESSIONS))),
        }
    }

    /// Keep routing history for at most `sessions` sessions.
    pub fn with_history_capacity(self, sessions: usize) -> Self {
        self.history.write().resize(history_capacity(sessions));
        self
    }

    /// A router loaded with the built-in rules and retry policies.
    pub fn with_defaults() -> Self {
        let router = Self::new();
        for rule in default_rules() {
            router.register_rule(rule);
        }
        *router.retry_policies.write() = default_policies();
        router
    }

    /// Add a rule. A rule with the same id for the same tool is replaced.
    pub fn register_rule(&self, rule: RoutingRule) {
        debug!(
            rule_id = %rule.id,
            source_tool = %rule.source_tool,
            target_tool = ?rule.redirect_to,
            priority = rule.priority,
            "Registered escalation rule"
        );
        let mut rules = self.rules.write();
        let entry = rules.entry(rule.source_tool.clone()).or_default();
        entry.retain(|existing| existing.id != rule.id);
        entry.push(rule);
    }

    /// Remove a rule by id. Returns whether it existed.
    pub fn remove_rule(&self, source_tool: &str, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let Some(entry) = rules.get_mut(source_tool) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|rule| rule.id != rule_id);
        before != entry.len()
    }

    pub fn rules_for(&self, source_tool: &str) -> Vec<RoutingRule> {
        self.rules
            .read()
            .get(source_tool)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_retry_policy(&self, class: impl Into<String>, policy: RetryPolicy) {
        self.retry_policies.write().insert(class.into(), policy);
    }

    /// Policy for a tool or escalation class.
    ///
    /// Falls back to the `default` class, then to [`RetryPolicy::default`].
    pub fn retry_policy_for(&self, class: &str) -> RetryPolicy {
        let policies = self.retry_policies.read();
        policies
            .get(class)
            .or_else(|| policies.get(DEFAULT_CLASS))
            .copied()
            .unwrap_or_default()
    }

    /// Every enabled rule for the event's source tool whose conditions all
    /// hold, sorted by descending priority.
    ///
    /// Rules with equal priority keep registration order.
    pub fn route(&self, event: &ToolEvent) -> Vec<MatchedRule> {
        let candidates: Vec<RoutingRule> = {
            let rules = self.rules.read();
            rules
                .get(&event.source_tool)
                .map(|rules| {
                    rules
                        .iter()
                        .filter(|rule| rule.enabled && all_match(&rule.conditions, event))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut matched: Vec<MatchedRule> = candidates
            .into_iter()
            .map(|rule| {
                let class = rule
                    .retry_class
                    .clone()
                    .unwrap_or_else(|| rule.source_tool.clone());
                MatchedRule {
                    parameters: rule.escalation_parameters(),
                    retry_policy: self.retry_policy_for(&class),
                    rule_id: rule.id,
                    source_tool: rule.source_tool,
                    action: rule.action,
                    target_tool: rule.redirect_to,
                    priority: rule.priority,
                }
            })
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));

        debug!(
            source_tool = %event.source_tool,
            event_type = %event.event_type,
            matched = matched.len(),
            "Routed tool event"
        );

        if let Some(session_id) = event.session_id() {
            self.record(session_id, event, &matched);
        }
        matched
    }

    /// Routing decisions for a session, oldest first.
    pub fn routing_history(&self, session_id: &str) -> Vec<RoutingRecord> {
        self.history
            .read()
            .peek(session_id)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a session's routing history.
    pub fn clear_history(&self, session_id: &str) {
        self.history.write().pop(session_id);
    }

    fn record(&self, session_id: &str, event: &ToolEvent, matched: &[MatchedRule]) {
        let record = RoutingRecord {
            timestamp: Utc::now(),
            source_tool: event.source_tool.clone(),
            event_type: event.event_type.clone(),
            matched_rules: matched.iter().map(|m| m.rule_id.clone()).collect(),
            target_tool: matched.first().and_then(|m| m.target_tool.clone()),
        };

        let mut history = self.history.write();
        let records = history.get_or_insert_mut(session_id.to_string(), VecDeque::new);
        if records.len() >= ROUTING_HISTORY_LIMIT {
            records.pop_front();
        }
        records.push_back(record);
    }
}

fn history_capacity(sessions: usize) -> NonZeroUsize {
    NonZeroUsize::new(sessions).unwrap_or(NonZeroUsize::MIN)
}

/// Whether a tool's parameters mark it as invoked by an escalation.
pub fn is_escalation(parameters: &BTreeMap<String, String>) -> bool {
    parameters
        .get(PARAM_ESCALATION_MODE)
        .is_some_and(|mode| mode == ESCALATION_MODE_AUTO)
}

/// Tool whose failure caused an escalated invocation.
pub fn escalation_source(parameters: &BTreeMap<String, String>) -> Option<&str> {
    if !is_escalation(parameters) {
        return None;
    }
    parameters.get(PARAM_ESCALATION_SOURCE).map(String::as_str)
}

/// Built-in escalation rules for the containerization pipeline.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::redirect("build_dockerfile_escalation", "build_image", "generate_dockerfile")
            .with_name("Dockerfile build failure")
            .with_description("Regenerate the Dockerfile when the build fails on it")
            .with_condition(Condition::new("error_type", Operator::Contains, "build_error"))
            .with_condition(Condition::new("message", Operator::Contains, "dockerfile"))
            .with_parameter("fix_dockerfile", "true")
            .with_retry_class("escalated_build")
            .with_priority(100),
        RoutingRule::redirect("build_resource_escalation", "build_image", "generate_manifests")
            .with_name("Build resource failure")
            .with_description("Adjust manifest resource limits when the build runs out of resources")
            .with_condition(Condition::new("error_type", Operator::Contains, "build_error"))
            .with_condition(Condition::new("message", Operator::Contains, "resource"))
            .with_parameter("fix_resources", "true")
            .with_retry_class("escalated_build")
            .with_priority(90),
        RoutingRule::redirect(
            "deploy_manifest_escalation",
            "deploy_kubernetes",
            "generate_manifests",
        )
        .with_name("Deployment validation failure")
        .with_description("Regenerate manifests when the cluster rejects them")
        .with_condition(Condition::new("error_type", Operator::Contains, "deploy"))
        .with_parameter("fix_validation", "true")
        .with_retry_class("escalated_deploy")
        .with_priority(100),
        RoutingRule::redirect("scan_base_image_escalation", "scan_security", "build_image")
            .with_name("Base image vulnerabilities")
            .with_description("Rebuild on a patched base image when the scan finds vulnerabilities")
            .with_condition(Condition::new("error_type", Operator::Contains, "vulnerab"))
            .with_parameter("update_base_image", "true")
            .with_retry_class("escalated_build")
            .with_priority(100),
    ]
}
