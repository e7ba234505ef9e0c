//! Mapping from `stevedore-config` sections to runtime settings.

use std::time::Duration;

use stevedore_checkpoint::{CheckpointOptions, RestorePolicy};
use stevedore_config::{
    BackoffKind, CheckpointSection, CompressionMode, ConditionSection, CoordinationSection,
    EscalationSection, OperatorKind, RestorePolicyKind, RetryPolicySection, RuleActionKind,
    RuleSection, ScopeKind,
};
use stevedore_coordination::retry::default_policies;
use stevedore_coordination::{
    Backoff, Condition, CoordinationConfig, EscalationRouter, Operator, RetryPolicy, RoutingRule,
    RuleAction,
};
use stevedore_types::ConditionScope;
use tracing::debug;

pub fn checkpoint_options(section: &CheckpointSection) -> CheckpointOptions {
    let options = CheckpointOptions::new()
        .with_integrity(section.integrity)
        .with_restore_policy(match section.restore_policy {
            RestorePolicyKind::BestEffort => RestorePolicy::BestEffort,
            RestorePolicyKind::Strict => RestorePolicy::Strict,
        });
    match section.compression {
        CompressionMode::Zstd => options.with_compression_level(section.compression_level),
        CompressionMode::None => options.without_compression(),
    }
}

pub fn coordination_config(
    coordination: &CoordinationSection,
    escalation: &EscalationSection,
) -> CoordinationConfig {
    CoordinationConfig::new()
        .with_timeout(Duration::from_secs(coordination.timeout_secs))
        .with_metrics_queue_capacity(coordination.metrics_queue_capacity)
        .with_escalation(escalation.enabled)
}

pub fn retry_policy(section: &RetryPolicySection) -> RetryPolicy {
    let initial = Duration::from_millis(section.initial_delay_ms);
    match section.backoff {
        BackoffKind::Fixed => RetryPolicy::fixed(section.max_attempts, initial),
        BackoffKind::Exponential => RetryPolicy::exponential(
            section.max_attempts,
            initial,
            Duration::from_millis(section.max_delay_ms),
        ),
    }
}

pub fn condition(section: &ConditionSection) -> Condition {
    let operator = match section.operator {
        OperatorKind::Equals => Operator::Equals,
        OperatorKind::Contains => Operator::Contains,
        OperatorKind::GreaterThan => Operator::GreaterThan,
        OperatorKind::LessThan => Operator::LessThan,
        OperatorKind::Exists => Operator::Exists,
    };
    let scope = match section.scope {
        ScopeKind::Any => ConditionScope::Any,
        ScopeKind::Output => ConditionScope::Output,
        ScopeKind::Context => ConditionScope::Context,
        ScopeKind::Metric => ConditionScope::Metric,
    };
    Condition::new(section.field.clone(), operator, section.value.clone()).in_scope(scope)
}

pub fn routing_rule(section: &RuleSection) -> RoutingRule {
    RoutingRule {
        id: section.id.clone(),
        name: if section.name.is_empty() {
            section.id.clone()
        } else {
            section.name.clone()
        },
        description: section.description.clone(),
        source_tool: section.source_tool.clone(),
        conditions: section.conditions.iter().map(condition).collect(),
        action: match section.action {
            RuleActionKind::Redirect => RuleAction::Redirect,
            RuleActionKind::Retry => RuleAction::Retry,
            RuleActionKind::Abort => RuleAction::Abort,
        },
        redirect_to: section.redirect_to.clone(),
        retry_class: section.retry_class.clone(),
        parameters: section.parameters.clone(),
        fix_errors: section.fix_errors,
        priority: section.priority,
        enabled: section.enabled,
    }
}

/// Build the escalation router: built-in rules (unless disabled), built-in
/// retry policies overlaid with configured ones, then configured rules.
///
/// A configured rule with the id of a built-in rule replaces it.
pub fn escalation_router(section: &EscalationSection) -> EscalationRouter {
    let router = if section.default_rules {
        EscalationRouter::with_defaults()
    } else {
        let router = EscalationRouter::new();
        for (class, policy) in default_policies() {
            router.set_retry_policy(class, policy);
        }
        router
    };

    for (class, policy) in &section.retry {
        router.set_retry_policy(class.clone(), retry_policy(policy));
    }
    for rule in &section.rules {
        router.register_rule(routing_rule(rule));
    }

    debug!(
        default_rules = section.default_rules,
        configured_rules = section.rules.len(),
        retry_overrides = section.retry.len(),
        "Escalation router configured"
    );
    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stevedore_checkpoint::Compression;
    use stevedore_config::StevedoreConfig;
    use stevedore_types::ToolEvent;

    const CONFIG: &str = r#"
[checkpoint]
compression = "none"
integrity = false
restore_policy = "strict"

[coordination]
timeout_secs = 5
metrics_queue_capacity = 8

[escalation]
enabled = true

[escalation.retry.escalated_build]
max_attempts = 4
backoff = "fixed"
initial_delay_ms = 250

[escalation.retry.push_image]
max_attempts = 5
backoff = "exponential"
initial_delay_ms = 100
max_delay_ms = 800

[[escalation.rules]]
id = "registry_auth"
source_tool = "push_image"
redirect_to = "configure_registry"
priority = 50

[escalation.rules.parameters]
registry = "ghcr.io"

[[escalation.rules.conditions]]
field = "error_type"
operator = "contains"
value = "unauthorized"

[[escalation.rules.conditions]]
field = "attempt"
operator = "greater_than"
value = 1
scope = "context"
"#;

    #[test]
    fn test_sections_map_to_runtime_types() {
        let config = StevedoreConfig::from_toml(CONFIG).unwrap();

        let options = checkpoint_options(&config.checkpoint());
        assert_eq!(options.compression, Compression::None);
        assert!(!options.integrity);
        assert_eq!(options.restore_policy, RestorePolicy::Strict);

        let coordination = coordination_config(&config.coordination(), &config.escalation());
        assert_eq!(coordination.timeout, Duration::from_secs(5));
        assert_eq!(coordination.metrics_queue_capacity, 8);
        assert!(coordination.escalation_enabled);
    }

    #[test]
    fn test_default_checkpoint_section_compresses() {
        let options = checkpoint_options(&CheckpointSection::default());
        assert_eq!(options.compression, Compression::Zstd { level: 3 });
        assert!(options.integrity);
        assert_eq!(options.restore_policy, RestorePolicy::BestEffort);
    }

    #[test]
    fn test_router_overlays_configured_policies_and_rules() {
        let config = StevedoreConfig::from_toml(CONFIG).unwrap();
        let router = escalation_router(&config.escalation());

        assert_eq!(
            router.retry_policy_for("escalated_build"),
            RetryPolicy::fixed(4, Duration::from_millis(250))
        );
        assert_eq!(
            router.retry_policy_for("push_image").delay_for(3),
            Duration::from_millis(400)
        );
        // Built-ins survive the overlay.
        assert_eq!(
            router.retry_policy_for("escalated_deploy"),
            RetryPolicy::fixed(2, Duration::from_secs(10))
        );
        assert_eq!(router.rules_for("build_image").len(), 2);

        let event = ToolEvent::new(
            "push_image",
            "tool_failed",
            json!({ "error_type": "registry_unauthorized" }),
        )
        .with_context("attempt", json!(2));
        let matched = router.route(&event);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].rule_id, "registry_auth");
        assert_eq!(matched[0].target_tool.as_deref(), Some("configure_registry"));
        assert_eq!(matched[0].parameters["registry"], "ghcr.io");
        assert_eq!(matched[0].parameters["escalation_mode"], "auto");

        let first_attempt = ToolEvent::new(
            "push_image",
            "tool_failed",
            json!({ "error_type": "registry_unauthorized" }),
        )
        .with_context("attempt", json!(1));
        assert!(router.route(&first_attempt).is_empty());
    }

    #[test]
    fn test_default_rules_can_be_disabled() {
        let section = EscalationSection {
            default_rules: false,
            ..Default::default()
        };
        let router = escalation_router(&section);
        assert!(router.rules_for("build_image").is_empty());
        assert_eq!(
            router.retry_policy_for("escalated_build"),
            RetryPolicy::fixed(2, Duration::from_secs(5))
        );
    }

    #[test]
    fn test_rule_name_defaults_to_id() {
        let rule = routing_rule(&RuleSection {
            id: "r1".into(),
            source_tool: "build_image".into(),
            action: RuleActionKind::Abort,
            ..Default::default()
        });
        assert_eq!(rule.name, "r1");
        assert_eq!(rule.action, RuleAction::Abort);
        assert!(rule.enabled);
    }
}
