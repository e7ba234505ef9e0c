//! Durable checkpoints for containerization workflow sessions.
//!
//! A checkpoint captures a [`WorkflowSession`](stevedore_types::WorkflowSession)
//! at a stage boundary so a failed or interrupted workflow can resume from the
//! last good point instead of starting over.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CheckpointStore                                                        │
//! │  - Full and incremental (delta) checkpoints                             │
//! │  - Envelope per record: zstd payload, SHA-256 checksum, metadata        │
//! │  - Secondary id index for delete-by-id                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  KvStore                                                                │
//! │  - SqliteKv: single file, WAL mode                                      │
//! │  - MemoryKv: tests and ephemeral runs                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use stevedore_checkpoint::{CheckpointOptions, CheckpointStore};
//! use stevedore_types::WorkflowSession;
//!
//! let store = CheckpointStore::open("checkpoints.db", CheckpointOptions::default())?;
//!
//! let mut session = WorkflowSession::new("wf-1", "containerize");
//! session.start_stage("build_image")?;
//! let checkpoint = store.create_checkpoint(&session, "build_image", "before build", None)?;
//!
//! let restored = store.restore_from_checkpoint(&session.id, &checkpoint.id)?;
//! assert_eq!(restored.current_stage.as_deref(), Some("build_image"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod envelope;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod options;
pub mod store;

pub use envelope::{CheckpointEnvelope, ENVELOPE_VERSION, StoredRecord};
pub use error::{CheckpointError, Result};
pub use kv::{KvStore, MemoryKv, ReadTxn, SqliteKv, WriteTxn};
pub use metrics::CheckpointMetrics;
pub use options::{
    CheckpointOptions, Clock, Compression, DEFAULT_COMPRESSION_LEVEL, ManualClock, RestorePolicy,
    SystemClock,
};
pub use store::CheckpointStore;
