//! Error types for the coordination crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while routing failures or coordinating tools.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A rule references a tool that has not been registered.
    #[error("{role} tool {tool} not registered")]
    ToolNotRegistered { tool: String, role: &'static str },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    /// A tool depends on a tool the graph does not know.
    #[error("Tool {tool} depends on unregistered tool {dependency}")]
    UnknownDependency { tool: String, dependency: String },

    /// No in-flight coordination with this id.
    #[error("Coordination {0} not found")]
    CoordinationNotFound(String),

    /// The coordination already received its completion.
    #[error("Coordination {0} already completed")]
    AlreadyCompleted(String),

    /// The target tool did not signal completion in time.
    #[error(
        "Coordination {coordination_id} ({source_tool} -> {target_tool}) timed out after {timeout:?}"
    )]
    Timeout {
        coordination_id: String,
        source_tool: String,
        target_tool: String,
        timeout: Duration,
    },

    /// The caller cancelled the coordination wait.
    #[error("Coordination {coordination_id} cancelled")]
    Cancelled { coordination_id: String },

    /// A rule's payload transform rejected the event data.
    #[error("Data transformation failed for rule {rule_id}: {reason}")]
    Transform { rule_id: String, reason: String },

    /// The communication bridge could not deliver a message.
    #[error("Failed to send coordination message from {from} to {to}: {reason}")]
    Dispatch {
        from: String,
        to: String,
        reason: String,
    },

    /// A message handler rejected a delivered message.
    #[error("Handler for {tool} failed: {reason}")]
    Handler { tool: String, reason: String },
}

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;
