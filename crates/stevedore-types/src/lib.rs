//! Shared types for the Stevedore workflow engine.
//!
//! These types are shared between `stevedore-checkpoint` (which persists
//! session snapshots), `stevedore-coordination` (which routes tool failures)
//! and `stevedore-runtime` (which wires both to a live session manager).

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod failure;
pub mod manager;
pub mod session;
pub mod snapshot;

pub use checkpoint::{WorkflowCheckpoint, WorkflowSpecRef};
pub use error::{Result, SessionError};
pub use event::{ConditionScope, FAILURE_EVENT, ToolEvent, ToolMessage};
pub use failure::{Severity, WorkflowError};
pub use manager::{SessionManager, SharedSessionManager};
pub use session::{WorkflowSession, WorkflowStatus};
pub use snapshot::{SessionDeltaV1, SessionSnapshot, SessionStateV1, StageChange};
