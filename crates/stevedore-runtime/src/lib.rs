//! Stevedore workflow runtime.
//!
//! Ties the pieces together: a [`SessionManager`](stevedore_types::SessionManager)
//! holds live sessions, the [`CheckpointStore`](stevedore_checkpoint::CheckpointStore)
//! makes them survive restarts, and the
//! [`ToolCoordinator`](stevedore_coordination::ToolCoordinator) decides what
//! happens when a stage fails.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stevedore_config::load_config;
//! use stevedore_coordination::InMemoryBridge;
//! use stevedore_runtime::{InMemorySessionManager, WorkflowRuntime};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> stevedore_runtime::Result<()> {
//! let loaded = load_config(Some(std::path::Path::new(".")))?;
//! let runtime = WorkflowRuntime::from_config(
//!     &loaded.config,
//!     Arc::new(InMemoryBridge::new()),
//!     Arc::new(InMemorySessionManager::new()),
//! )?;
//! let _expiry = runtime.spawn_expiry_task(CancellationToken::new());
//!
//! let session = runtime.resume("4f9c2a").await?;
//! println!("resumed at {:?}", session.current_stage);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod runtime;
pub mod session;
pub mod settings;

pub use error::{Result, RuntimeError};
pub use runtime::{
    DEFAULT_CLEANUP_INTERVAL, FATAL_FAILURE_KEY, LAST_ESCALATION_KEY, WorkflowRuntime,
    last_escalation,
};
pub use session::InMemorySessionManager;
