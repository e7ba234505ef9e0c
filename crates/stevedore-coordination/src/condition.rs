//! Rule conditions evaluated against tool events.
//!
//! Escalation rules and coordination rules share this model: a condition
//! names a field, where to find it, an operator and an expected value. A
//! rule matches only when all of its conditions hold.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stevedore_types::{ConditionScope, ToolEvent};

/// Comparison applied to a looked-up field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    /// Case-insensitive substring for strings, membership for arrays.
    Contains,
    GreaterThan,
    LessThan,
    /// The field is present (expected `true`) or absent (expected `false`).
    Exists,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::Contains => "contains",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::Exists => "exists",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "equals" | "eq" => Ok(Operator::Equals),
            "contains" => Ok(Operator::Contains),
            "greater_than" | "gt" => Ok(Operator::GreaterThan),
            "less_than" | "lt" => Ok(Operator::LessThan),
            "exists" => Ok(Operator::Exists),
            other => Err(format!("unknown operator: {other}")),
        }
    }
}

/// A single predicate over an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    #[serde(default)]
    pub scope: ConditionScope,
}

impl Condition {
    /// Condition looking in the event output, then its context.
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            scope: ConditionScope::Any,
        }
    }

    /// Condition on the event's structured output.
    pub fn output(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::new(field, operator, value).in_scope(ConditionScope::Output)
    }

    /// Condition on a value under `context.metrics`.
    pub fn metric(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::new(field, operator, value).in_scope(ConditionScope::Metric)
    }

    /// Holds when the context has the key.
    pub fn context_exists(field: impl Into<String>) -> Self {
        Self::new(field, Operator::Exists, true).in_scope(ConditionScope::Context)
    }

    pub fn in_scope(mut self, scope: ConditionScope) -> Self {
        self.scope = scope;
        self
    }

    /// Evaluate against an event. Never errors: a missing field or a
    /// non-numeric operand to a numeric operator fails the condition.
    pub fn matches(&self, event: &ToolEvent) -> bool {
        let actual = event.lookup(&self.field, self.scope);
        if self.operator == Operator::Exists {
            let expected = self.value.as_bool().unwrap_or(true);
            return actual.is_some() == expected;
        }
        actual.is_some_and(|actual| compare(actual, self.operator, &self.value))
    }
}

/// Whether every condition holds. An empty list always holds.
pub fn all_match(conditions: &[Condition], event: &ToolEvent) -> bool {
    conditions.iter().all(|c| c.matches(event))
}

fn compare(actual: &Value, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Equals => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => actual == expected,
        },
        Operator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            (Value::Array(items), expected) => items.iter().any(|item| item == expected),
            _ => false,
        },
        Operator::GreaterThan => numeric(actual, expected).is_some_and(|(a, b)| a > b),
        Operator::LessThan => numeric(actual, expected).is_some_and(|(a, b)| a < b),
        Operator::Exists => true,
    }
}

fn numeric(actual: &Value, expected: &Value) -> Option<(f64, f64)> {
    Some((actual.as_f64()?, expected.as_f64()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> ToolEvent {
        ToolEvent::new(
            "build_image",
            "tool_failed",
            json!({
                "error_type": "docker_build_error",
                "message": "Dockerfile syntax error on line 3",
                "exit_code": 2,
                "tags": ["dockerfile", "syntax"],
            }),
        )
        .with_context("session_id", json!("s-1"))
        .with_metric("severity_score", json!(8.5))
    }

    #[test]
    fn test_contains_ignores_case() {
        let c = Condition::new("message", Operator::Contains, "DOCKERFILE");
        assert!(c.matches(&event()));
        let c = Condition::new("tags", Operator::Contains, "syntax");
        assert!(c.matches(&event()));
    }

    #[test]
    fn test_numeric_operators() {
        assert!(Condition::metric("severity_score", Operator::GreaterThan, 7.0).matches(&event()));
        assert!(!Condition::metric("severity_score", Operator::LessThan, 7).matches(&event()));
        assert!(Condition::output("exit_code", Operator::Equals, 2.0).matches(&event()));
    }

    #[test]
    fn test_non_numeric_operand_fails() {
        let c = Condition::new("message", Operator::GreaterThan, 1);
        assert!(!c.matches(&event()));
        let c = Condition::new("exit_code", Operator::GreaterThan, "1");
        assert!(!c.matches(&event()));
    }

    #[test]
    fn test_scopes_are_respected() {
        // session_id is context, not output
        assert!(!Condition::output("session_id", Operator::Equals, "s-1").matches(&event()));
        assert!(Condition::new("session_id", Operator::Equals, "s-1").matches(&event()));
        assert!(Condition::context_exists("session_id").matches(&event()));
        assert!(!Condition::context_exists("workspace").matches(&event()));
        assert!(!Condition::metric("exit_code", Operator::Equals, 2).matches(&event()));
    }

    #[test]
    fn test_missing_field_fails() {
        assert!(!Condition::new("nope", Operator::Equals, "x").matches(&event()));
        let absent = Condition::new("nope", Operator::Exists, false);
        assert!(absent.matches(&event()));
    }

    #[test]
    fn test_all_match_is_conjunctive() {
        let conditions = vec![
            Condition::new("error_type", Operator::Contains, "build_error"),
            Condition::new("message", Operator::Contains, "resource"),
        ];
        assert!(!all_match(&conditions, &event()));
        assert!(all_match(&conditions[..1], &event()));
        assert!(all_match(&[], &event()));
    }

    #[test]
    fn test_operator_parse() {
        assert_eq!("GREATER_THAN".parse::<Operator>().unwrap(), Operator::GreaterThan);
        assert!("between".parse::<Operator>().is_err());
    }
}
