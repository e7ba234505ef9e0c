//! Checkpoint store options and clock.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Default zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Payload compression applied before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Compression {
    /// Name recorded in envelope metadata.
    pub fn mode_name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd { .. } => "zstd",
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd {
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// What to do when a checksum does not match on restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestorePolicy {
    /// Log a warning and decode the payload anyway.
    #[default]
    BestEffort,
    /// Fail with [`CheckpointError::Integrity`](crate::CheckpointError::Integrity).
    Strict,
}

/// Options for the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOptions {
    pub compression: Compression,
    /// Write a SHA-256 checksum and verify it on read.
    pub integrity: bool,
    pub restore_policy: RestorePolicy,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            integrity: true,
            restore_policy: RestorePolicy::BestEffort,
        }
    }
}

impl CheckpointOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compress payloads with zstd at the given level.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression = Compression::Zstd { level };
        self
    }

    /// Store payloads uncompressed.
    pub fn without_compression(mut self) -> Self {
        self.compression = Compression::None;
        self
    }

    pub fn with_integrity(mut self, enabled: bool) -> Self {
        self.integrity = enabled;
        self
    }

    pub fn with_restore_policy(mut self, policy: RestorePolicy) -> Self {
        self.restore_policy = policy;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Time source for checkpoint timestamps and expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
