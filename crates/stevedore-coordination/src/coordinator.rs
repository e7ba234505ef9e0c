//! Cross-tool coordination engine.
//!
//! A coordination is one hand-off from a source tool to a target tool:
//! the coordinator sends a message through the [`CommunicationBridge`] and
//! waits until the target reports back through
//! [`ToolCoordinator::complete_coordination`], the caller cancels, or the
//! timeout expires. Each coordination is tracked while in flight and removed
//! once it resolves, whatever the outcome.
//!
//! ```text
//!            ┌──────────── completed
//!            │
//! running ───┼──────────── cancelled
//!            │
//!            ├──────────── timeout
//!            │
//!            └──────────── failed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use stevedore_types::{ToolEvent, ToolMessage, WorkflowError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::CommunicationBridge;
use crate::classifier::is_fatal;
use crate::condition::{Condition, Operator, all_match};
use crate::error::{CoordinationError, Result};
use crate::graph::{NodeStatus, ToolDependencyGraph};
use crate::metrics::{CoordinationMetrics, DEFAULT_QUEUE_CAPACITY, MetricsRecorder, Outcome};
use crate::retry::RetryPolicy;
use crate::router::{EscalationRouter, MatchedRule, RuleAction};

/// Message type used for coordination hand-offs.
pub const COORDINATION_MESSAGE: &str = "coordination";

/// Default wait for a target tool to report completion.
pub const DEFAULT_COORDINATION_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// How long to wait for a target tool before giving up.
    pub timeout: Duration,
    /// Capacity of the metrics update queue.
    pub metrics_queue_capacity: usize,
    /// Install the built-in coordination rules.
    pub default_rules: bool,
    /// Route recoverable failures through the escalation router.
    pub escalation_enabled: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COORDINATION_TIMEOUT,
            metrics_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_rules: true,
            escalation_enabled: true,
        }
    }
}

impl CoordinationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics_queue_capacity(mut self, capacity: usize) -> Self {
        self.metrics_queue_capacity = capacity;
        self
    }

    pub fn with_default_rules(mut self, enabled: bool) -> Self {
        self.default_rules = enabled;
        self
    }

    pub fn with_escalation(mut self, enabled: bool) -> Self {
        self.escalation_enabled = enabled;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tools and rules
// ─────────────────────────────────────────────────────────────────────────────

/// What a tool consumes and produces, and what it must run after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCapability {
    pub tool_name: String,
    #[serde(default)]
    pub input_types: Vec<String>,
    #[serde(default)]
    pub output_types: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ToolCapability {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_types = types.into_iter().map(Into::into).collect();
        self
    }
}

/// Reshapes event data before it is sent to the target tool.
pub type DataTransform = Arc<dyn Fn(&Value) -> std::result::Result<Value, String> + Send + Sync>;

/// When and where to hand off an event.
#[derive(Clone)]
pub struct CoordinationRule {
    pub id: String,
    pub name: String,
    pub source_tool: String,
    pub target_tool: String,
    /// Event type that triggers the rule; `None` matches every event.
    pub trigger_event: Option<String>,
    pub conditions: Vec<Condition>,
    pub transform: Option<DataTransform>,
    pub priority: i32,
    pub metadata: Map<String, Value>,
}

impl fmt::Debug for CoordinationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("source_tool", &self.source_tool)
            .field("target_tool", &self.target_tool)
            .field("trigger_event", &self.trigger_event)
            .field("conditions", &self.conditions)
            .field("transform", &self.transform.is_some())
            .field("priority", &self.priority)
            .finish()
    }
}

impl CoordinationRule {
    pub fn new(
        id: impl Into<String>,
        source_tool: impl Into<String>,
        target_tool: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source_tool: source_tool.into(),
            target_tool: target_tool.into(),
            trigger_event: None,
            conditions: Vec::new(),
            transform: None,
            priority: 0,
            metadata: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_trigger(mut self, event_type: impl Into<String>) -> Self {
        self.trigger_event = Some(event_type.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn applies_to(&self, event: &ToolEvent) -> bool {
        self.source_tool == event.source_tool
            && self
                .trigger_event
                .as_deref()
                .is_none_or(|trigger| trigger == event.event_type)
            && all_match(&self.conditions, event)
    }
}

/// Built-in coordination rules.
pub fn default_coordination_rules() -> Vec<CoordinationRule> {
    vec![
        CoordinationRule::new("build_failure_analyze", "build_image", "analyze_repository")
            .with_name("Route build failures to analysis")
            .with_trigger("build_failed")
            .with_condition(Condition::output(
                "error_type",
                Operator::Equals,
                "dockerfile_error",
            ))
            .with_priority(10),
        CoordinationRule::new("security_vuln_rebuild", "scan_security", "build_image")
            .with_name("Trigger rebuild on security vulnerabilities")
            .with_trigger("vulnerabilities_found")
            .with_condition(Condition::metric(
                "severity_score",
                Operator::GreaterThan,
                7.0,
            ))
            .with_priority(9),
        CoordinationRule::new(
            "deploy_failure_regenerate",
            "deploy_kubernetes",
            "generate_manifests",
        )
        .with_name("Regenerate manifests on deployment failure")
        .with_trigger("deployment_failed")
        .with_condition(Condition::output(
            "error_type",
            Operator::Equals,
            "manifest_invalid",
        ))
        .with_priority(8),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordination state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of one coordination. Every state but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationStatus {
    Running,
    Completed,
    Cancelled,
    #[serde(rename = "timeout")]
    TimedOut,
    Failed,
}

impl CoordinationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CoordinationStatus::Running)
    }
}

/// What the target tool reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration: Duration,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CoordinationResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Snapshot of an in-flight coordination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinationInfo {
    pub id: String,
    pub source_tool: String,
    pub target_tool: String,
    pub started_at: DateTime<Utc>,
    pub status: CoordinationStatus,
    pub messages: Vec<ToolMessage>,
    pub context: Map<String, Value>,
}

struct ActiveCoordination {
    info: CoordinationInfo,
    completion: Option<oneshot::Sender<CoordinationResult>>,
}

/// Removes an active coordination when dropped, so the record goes away on
/// every exit path, including the caller dropping the future.
struct ActiveGuard<'a> {
    active: &'a RwLock<HashMap<String, ActiveCoordination>>,
    id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.write().remove(&self.id);
    }
}

/// How a stage failure was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// The failure is fatal; the workflow should stop.
    Fatal { error_type: String },
    /// The failure was handed to a corrective tool, which reported back.
    Redirected {
        rule_id: String,
        target_tool: String,
        parameters: std::collections::BTreeMap<String, String>,
        retry_policy: RetryPolicy,
        result: CoordinationResult,
    },
    /// Re-run the failing tool under this policy.
    Retry {
        rule_id: String,
        retry_policy: RetryPolicy,
    },
    /// A rule asked for the workflow to stop.
    Aborted { rule_id: String },
    /// Recoverable, but no rule applies or escalation is disabled.
    Unhandled,
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Orchestrates hand-offs between tools.
pub struct ToolCoordinator {
    config: CoordinationConfig,
    tools: RwLock<HashMap<String, ToolCapability>>,
    rules: RwLock<Vec<CoordinationRule>>,
    graph: Arc<ToolDependencyGraph>,
    router: Arc<EscalationRouter>,
    bridge: Arc<dyn CommunicationBridge>,
    active: RwLock<HashMap<String, ActiveCoordination>>,
    metrics: MetricsRecorder,
}

impl fmt::Debug for ToolCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCoordinator")
            .field("config", &self.config)
            .field("tools", &self.tools.read().len())
            .field("rules", &self.rules.read().len())
            .field("active", &self.active.read().len())
            .finish_non_exhaustive()
    }
}

impl ToolCoordinator {
    /// Create a coordinator with the built-in escalation router.
    ///
    /// When called inside a Tokio runtime the metrics worker is started on
    /// it; otherwise metrics are applied inline.
    pub fn new(bridge: Arc<dyn CommunicationBridge>, config: CoordinationConfig) -> Self {
        let rules = if config.default_rules {
            default_coordination_rules()
        } else {
            Vec::new()
        };
        Self {
            metrics: MetricsRecorder::new(config.metrics_queue_capacity),
            config,
            tools: RwLock::new(HashMap::new()),
            rules: RwLock::new(rules),
            graph: Arc::new(ToolDependencyGraph::new()),
            router: Arc::new(EscalationRouter::with_defaults()),
            bridge,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the escalation router.
    pub fn with_router(mut self, router: Arc<EscalationRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<EscalationRouter> {
        &self.router
    }

    pub fn graph(&self) -> &Arc<ToolDependencyGraph> {
        &self.graph
    }

    /// Register a tool and add it to the dependency graph.
    pub fn register_tool(&self, capability: ToolCapability) {
        self.graph
            .add_node(capability.tool_name.clone(), capability.dependencies.clone());
        info!(
            tool_name = %capability.tool_name,
            input_types = ?capability.input_types,
            output_types = ?capability.output_types,
            "Tool registered with coordinator"
        );
        self.tools
            .write()
            .insert(capability.tool_name.clone(), capability);
    }

    pub fn is_registered(&self, tool_name: &str) -> bool {
        self.tools.read().contains_key(tool_name)
    }

    pub fn tool(&self, tool_name: &str) -> Option<ToolCapability> {
        self.tools.read().get(tool_name).cloned()
    }

    /// Add a rule. Both its source and target tools must be registered.
    pub fn add_coordination_rule(&self, rule: CoordinationRule) -> Result<()> {
        {
            let tools = self.tools.read();
            if !tools.contains_key(&rule.source_tool) {
                return Err(CoordinationError::ToolNotRegistered {
                    tool: rule.source_tool,
                    role: "source",
                });
            }
            if !tools.contains_key(&rule.target_tool) {
                return Err(CoordinationError::ToolNotRegistered {
                    tool: rule.target_tool,
                    role: "target",
                });
            }
        }

        info!(
            rule_id = %rule.id,
            source_tool = %rule.source_tool,
            target_tool = %rule.target_tool,
            "Coordination rule added"
        );
        self.rules.write().push(rule);
        Ok(())
    }

    pub fn coordination_rules(&self) -> Vec<CoordinationRule> {
        self.rules.read().clone()
    }

    /// In-flight coordinations, oldest first.
    pub fn active_coordinations(&self) -> Vec<CoordinationInfo> {
        let mut active: Vec<CoordinationInfo> = self
            .active
            .read()
            .values()
            .map(|a| a.info.clone())
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// Coordination metrics, after applying queued updates.
    pub async fn metrics(&self) -> CoordinationMetrics {
        self.metrics.snapshot().await
    }

    /// Deliver the target tool's result to a waiting coordination.
    pub fn complete_coordination(
        &self,
        coordination_id: &str,
        result: CoordinationResult,
    ) -> Result<()> {
        let sender = {
            let mut active = self.active.write();
            let record = active
                .get_mut(coordination_id)
                .ok_or_else(|| CoordinationError::CoordinationNotFound(coordination_id.to_string()))?;
            record
                .completion
                .take()
                .ok_or_else(|| CoordinationError::AlreadyCompleted(coordination_id.to_string()))?
        };

        sender
            .send(result)
            .map_err(|_| CoordinationError::AlreadyCompleted(coordination_id.to_string()))
    }

    /// Run every coordination rule that applies to an event.
    ///
    /// Rules run one after another in descending priority. The first failure
    /// aborts the call; otherwise the last rule's result is returned. With
    /// no applicable rule the result is a success with a `message` entry.
    pub async fn coordinate_execution(
        &self,
        event: &ToolEvent,
        cancel: &CancellationToken,
    ) -> Result<CoordinationResult> {
        let started = Instant::now();

        let mut rules: Vec<CoordinationRule> = self
            .rules
            .read()
            .iter()
            .filter(|rule| rule.applies_to(event))
            .cloned()
            .collect();

        if rules.is_empty() {
            debug!(
                source_tool = %event.source_tool,
                event_type = %event.event_type,
                "No applicable coordination rules"
            );
            return Ok(CoordinationResult {
                success: true,
                duration: started.elapsed(),
                metadata: Map::from_iter([("message".to_string(), json!("no applicable rules"))]),
                ..Default::default()
            });
        }

        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut last = CoordinationResult::default();
        for rule in &rules {
            let payload = match &rule.transform {
                Some(transform) => match transform(&event.data) {
                    Ok(payload) => payload,
                    Err(reason) => {
                        error!(rule_id = %rule.id, reason = %reason, "Coordination data transform failed");
                        self.record_outcome(rule_pair(rule), false, started.elapsed());
                        return Err(CoordinationError::Transform {
                            rule_id: rule.id.clone(),
                            reason,
                        });
                    }
                },
                None => event.data.clone(),
            };

            let rule_started = Instant::now();
            match self
                .run(&rule.source_tool, &rule.target_tool, payload, event.context.clone(), cancel)
                .await
            {
                Ok(mut result) => {
                    result.duration = rule_started.elapsed();
                    self.record_outcome(rule_pair(rule), result.success, result.duration);
                    last = result;
                }
                Err(e) => {
                    error!(
                        rule_id = %rule.id,
                        source_tool = %rule.source_tool,
                        target_tool = %rule.target_tool,
                        error = %e,
                        "Coordination execution failed"
                    );
                    self.record_outcome(rule_pair(rule), false, rule_started.elapsed());
                    return Err(e);
                }
            }
        }

        Ok(last)
    }

    /// Classify a stage failure and, if recoverable, hand it to the
    /// highest-priority matching escalation rule.
    ///
    /// A redirect waits for the target tool like any coordination and
    /// updates the target's dependency-graph bookkeeping.
    pub async fn handle_failure(
        &self,
        failure: &WorkflowError,
        context: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<FailureOutcome> {
        if is_fatal(failure) {
            warn!(
                source_tool = %failure.tool,
                error_type = %failure.error_type,
                severity = %failure.severity,
                "Fatal failure; not escalating"
            );
            return Ok(FailureOutcome::Fatal {
                error_type: failure.error_type.clone(),
            });
        }

        if !self.config.escalation_enabled {
            debug!(source_tool = %failure.tool, "Escalation disabled");
            return Ok(FailureOutcome::Unhandled);
        }

        let event = ToolEvent::from_failure(failure, context);
        let Some(matched) = self.router.route(&event).into_iter().next() else {
            debug!(
                source_tool = %failure.tool,
                error_type = %failure.error_type,
                "No escalation rule matched"
            );
            return Ok(FailureOutcome::Unhandled);
        };

        match matched.action {
            RuleAction::Abort => {
                info!(rule_id = %matched.rule_id, source_tool = %failure.tool, "Escalation rule aborts workflow");
                Ok(FailureOutcome::Aborted {
                    rule_id: matched.rule_id,
                })
            }
            RuleAction::Retry => Ok(FailureOutcome::Retry {
                rule_id: matched.rule_id,
                retry_policy: matched.retry_policy,
            }),
            RuleAction::Redirect => self.redirect(failure, event, matched, cancel).await,
        }
    }

    async fn redirect(
        &self,
        failure: &WorkflowError,
        event: ToolEvent,
        matched: MatchedRule,
        cancel: &CancellationToken,
    ) -> Result<FailureOutcome> {
        let Some(target) = matched.target_tool.clone() else {
            warn!(rule_id = %matched.rule_id, "Redirect rule has no target tool");
            return Ok(FailureOutcome::Unhandled);
        };
        if !self.is_registered(&target) {
            return Err(CoordinationError::ToolNotRegistered {
                tool: target,
                role: "target",
            });
        }

        self.graph.set_status(&target, NodeStatus::Running);
        self.graph.record_run(&target, Utc::now());

        let payload = json!({
            "failure": failure,
            "parameters": matched.parameters,
        });
        let mut context = event.context;
        context.insert("escalation_parameters".to_string(), json!(matched.parameters));

        info!(
            rule_id = %matched.rule_id,
            source_tool = %failure.tool,
            target_tool = %target,
            "Escalating failure"
        );

        let started = Instant::now();
        let pair = (failure.tool.clone(), target.clone());
        match self.run(&failure.tool, &target, payload, context, cancel).await {
            Ok(mut result) => {
                result.duration = started.elapsed();
                let status = if result.success {
                    NodeStatus::Completed
                } else {
                    NodeStatus::Failed
                };
                self.graph.set_status(&target, status);
                self.record_outcome(pair, result.success, result.duration);
                Ok(FailureOutcome::Redirected {
                    rule_id: matched.rule_id,
                    target_tool: target,
                    parameters: matched.parameters,
                    retry_policy: matched.retry_policy,
                    result,
                })
            }
            Err(e) => {
                self.graph.set_status(&target, NodeStatus::Failed);
                self.record_outcome(pair, false, started.elapsed());
                Err(e)
            }
        }
    }

    /// Send one coordination message and wait for it to resolve.
    async fn run(
        &self,
        source_tool: &str,
        target_tool: &str,
        payload: Value,
        context: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<CoordinationResult> {
        let coordination_id = format!("coord_{}", Uuid::new_v4().simple());
        let (completion, done) = oneshot::channel();

        let message = ToolMessage::new(source_tool, target_tool, COORDINATION_MESSAGE, payload)
            .with_context(context.clone())
            .with_correlation(coordination_id.clone());

        self.active.write().insert(
            coordination_id.clone(),
            ActiveCoordination {
                info: CoordinationInfo {
                    id: coordination_id.clone(),
                    source_tool: source_tool.to_string(),
                    target_tool: target_tool.to_string(),
                    started_at: Utc::now(),
                    status: CoordinationStatus::Running,
                    messages: Vec::new(),
                    context,
                },
                completion: Some(completion),
            },
        );
        let _guard = ActiveGuard {
            active: &self.active,
            id: coordination_id.clone(),
        };

        debug!(
            coordination_id = %coordination_id,
            source_tool,
            target_tool,
            message_id = %message.id,
            "Dispatching coordination message"
        );

        // Dispatch is covered by the same deadline and cancellation as the wait.
        let exchange = {
            let coordination_id = coordination_id.clone();
            async move {
                if let Err(e) = self
                    .bridge
                    .send(source_tool, target_tool, message.clone())
                    .await
                {
                    return Err(e);
                }
                if let Some(active) = self.active.write().get_mut(&coordination_id) {
                    active.info.messages.push(message);
                }
                done.await
                    .map_err(|_| CoordinationError::CoordinationNotFound(coordination_id))
            }
        };

        tokio::select! {
            biased;

            result = exchange => match result {
                Ok(result) => {
                    self.set_status(&coordination_id, CoordinationStatus::Completed);
                    info!(
                        coordination_id = %coordination_id,
                        source_tool,
                        target_tool,
                        success = result.success,
                        "Coordination completed"
                    );
                    Ok(result)
                }
                Err(e) => {
                    self.set_status(&coordination_id, CoordinationStatus::Failed);
                    Err(e)
                }
            },
            _ = cancel.cancelled() => {
                self.set_status(&coordination_id, CoordinationStatus::Cancelled);
                info!(coordination_id = %coordination_id, source_tool, target_tool, "Coordination cancelled");
                Err(CoordinationError::Cancelled {
                    coordination_id: coordination_id.clone(),
                })
            }
            _ = tokio::time::sleep(self.config.timeout) => {
                self.set_status(&coordination_id, CoordinationStatus::TimedOut);
                warn!(
                    coordination_id = %coordination_id,
                    source_tool,
                    target_tool,
                    timeout = ?self.config.timeout,
                    "Coordination timed out"
                );
                Err(CoordinationError::Timeout {
                    coordination_id: coordination_id.clone(),
                    source_tool: source_tool.to_string(),
                    target_tool: target_tool.to_string(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    fn set_status(&self, coordination_id: &str, status: CoordinationStatus) {
        if let Some(active) = self.active.write().get_mut(coordination_id) {
            active.info.status = status;
        }
    }

    fn record_outcome(&self, (source_tool, target_tool): (String, String), success: bool, duration: Duration) {
        self.metrics.record(Outcome {
            source_tool,
            target_tool,
            success,
            duration,
        });
    }
}

fn rule_pair(rule: &CoordinationRule) -> (String, String) {
    (rule.source_tool.clone(), rule.target_tool.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::InMemoryBridge;
    use stevedore_types::Severity;

    fn coordinator() -> ToolCoordinator {
        let coordinator = ToolCoordinator::new(
            Arc::new(InMemoryBridge::new()),
            CoordinationConfig::default(),
        );
        for tool in [
            "analyze_repository",
            "generate_dockerfile",
            "build_image",
            "scan_security",
            "generate_manifests",
            "deploy_kubernetes",
        ] {
            coordinator.register_tool(ToolCapability::new(tool));
        }
        coordinator
    }

    #[test]
    fn test_default_rules_installed() {
        let ids: Vec<_> = coordinator()
            .coordination_rules()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "build_failure_analyze",
                "security_vuln_rebuild",
                "deploy_failure_regenerate"
            ]
        );

        let bare = ToolCoordinator::new(
            Arc::new(InMemoryBridge::new()),
            CoordinationConfig::default().with_default_rules(false),
        );
        assert!(bare.coordination_rules().is_empty());
    }

    #[test]
    fn test_add_rule_requires_registered_tools() {
        let coordinator = coordinator();
        let err = coordinator
            .add_coordination_rule(CoordinationRule::new("r", "unknown", "build_image"))
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::ToolNotRegistered { role: "source", .. }
        ));

        let err = coordinator
            .add_coordination_rule(CoordinationRule::new("r", "build_image", "unknown"))
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::ToolNotRegistered { role: "target", .. }
        ));

        coordinator
            .add_coordination_rule(CoordinationRule::new("r", "build_image", "scan_security"))
            .unwrap();
        assert_eq!(coordinator.coordination_rules().len(), 4);
    }

    #[test]
    fn test_rule_applicability() {
        let rule = &default_coordination_rules()[1];
        let event = ToolEvent::new("scan_security", "vulnerabilities_found", json!({}))
            .with_metric("severity_score", json!(8.1));
        assert!(rule.applies_to(&event));

        let low = ToolEvent::new("scan_security", "vulnerabilities_found", json!({}))
            .with_metric("severity_score", json!(3));
        assert!(!rule.applies_to(&low));

        let wrong_trigger = ToolEvent::new("scan_security", "scan_done", json!({}))
            .with_metric("severity_score", json!(9));
        assert!(!rule.applies_to(&wrong_trigger));
    }

    #[test]
    fn test_complete_unknown_coordination() {
        let err = coordinator()
            .complete_coordination("coord_missing", CoordinationResult::success(json!(null)))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::CoordinationNotFound(_)));
    }

    #[tokio::test]
    async fn test_no_rules_is_success() {
        let coordinator = coordinator();
        let event = ToolEvent::new("analyze_repository", "done", json!({}));
        let result = coordinator
            .coordinate_execution(&event, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["message"], "no applicable rules");
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_routed() {
        let coordinator = coordinator();
        let failure = WorkflowError::new("build_image", "docker_build_error", "dockerfile broken")
            .with_severity(Severity::Critical);
        let outcome = coordinator
            .handle_failure(&failure, Map::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Fatal {
                error_type: "docker_build_error".into()
            }
        );
        assert!(coordinator.active_coordinations().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_disabled_is_unhandled() {
        let coordinator = ToolCoordinator::new(
            Arc::new(InMemoryBridge::new()),
            CoordinationConfig::default().with_escalation(false),
        );
        let failure = WorkflowError::new("build_image", "docker_build_error", "dockerfile broken");
        let outcome = coordinator
            .handle_failure(&failure, Map::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Unhandled);
    }

    #[tokio::test]
    async fn test_retry_rule_outcome() {
        let router = Arc::new(EscalationRouter::with_defaults());
        router.register_rule(
            crate::router::RoutingRule::retry("flaky_network", "deploy_kubernetes", "escalated_deploy")
                .with_condition(Condition::new("error_type", Operator::Contains, "timeout"))
                .with_priority(500),
        );
        let coordinator = coordinator().with_router(router);

        let failure = WorkflowError::new("deploy_kubernetes", "api_timeout", "cluster slow");
        let outcome = coordinator
            .handle_failure(&failure, Map::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retry {
                rule_id: "flaky_network".into(),
                retry_policy: RetryPolicy::fixed(2, Duration::from_secs(10)),
            }
        );
    }

    #[tokio::test]
    async fn test_redirect_to_unregistered_target_fails() {
        let coordinator = ToolCoordinator::new(
            Arc::new(InMemoryBridge::new()),
            CoordinationConfig::default(),
        );
        let failure = WorkflowError::new("build_image", "docker_build_error", "Dockerfile invalid");
        let err = coordinator
            .handle_failure(&failure, Map::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::ToolNotRegistered { ref tool, .. } if tool == "generate_dockerfile"
        ));
    }
}
