//! Failure handling and cross-tool coordination for Stevedore workflows.
//!
//! When a stage fails, the pieces here decide what happens next:
//!
//! - [`classifier`]: fatal or recoverable
//! - [`router`]: which corrective tool, if any, should take over, and under
//!   which retry policy
//! - [`coordinator`]: sends the hand-off and waits for the target tool
//! - [`graph`]: the order tools must run in
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stevedore_coordination::{
//!     CoordinationConfig, FailureOutcome, InMemoryBridge, ToolCapability, ToolCoordinator,
//! };
//! use stevedore_types::WorkflowError;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> stevedore_coordination::Result<()> {
//! let coordinator = ToolCoordinator::new(Arc::new(InMemoryBridge::new()), CoordinationConfig::default());
//! coordinator.register_tool(ToolCapability::new("build_image"));
//! coordinator.register_tool(ToolCapability::new("generate_dockerfile"));
//!
//! let failure = WorkflowError::new("build_image", "docker_build_error", "Dockerfile: unknown instruction");
//! match coordinator
//!     .handle_failure(&failure, Default::default(), &CancellationToken::new())
//!     .await?
//! {
//!     FailureOutcome::Redirected { target_tool, .. } => println!("fixed by {target_tool}"),
//!     other => println!("{other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod classifier;
pub mod condition;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod retry;
pub mod router;

pub use bridge::{CommunicationBridge, InMemoryBridge, MessageHandler};
pub use classifier::{ErrorClass, FATAL_ERROR_TYPES, classify, is_fatal};
pub use condition::{Condition, Operator};
pub use coordinator::{
    COORDINATION_MESSAGE, CoordinationConfig, CoordinationInfo, CoordinationResult,
    CoordinationRule, CoordinationStatus, DEFAULT_COORDINATION_TIMEOUT, DataTransform,
    FailureOutcome, ToolCapability, ToolCoordinator, default_coordination_rules,
};
pub use error::{CoordinationError, Result};
pub use graph::{DependencyNode, NodeStatus, ToolDependencyGraph};
pub use metrics::{CoordinationMetrics, ToolPairMetric};
pub use retry::{Backoff, RetryPolicy};
pub use router::{
    ESCALATION_MODE_AUTO, EscalationRouter, MatchedRule, PARAM_ESCALATION_MODE,
    PARAM_ESCALATION_SOURCE, RoutingRecord, RoutingRule, RuleAction, escalation_source,
    is_escalation,
};
