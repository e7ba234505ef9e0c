//! Aggregate statistics over stored checkpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What the store knows about one record without decoding its payload.
#[derive(Debug, Clone)]
pub(crate) struct RecordSummary {
    pub key: String,
    pub checkpoint_id: String,
    pub session_id: String,
    pub stage_name: String,
    pub timestamp: DateTime<Utc>,
    pub incremental: bool,
    pub parent: Option<String>,
    pub stored_bytes: usize,
}

/// Checkpoint store metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointMetrics {
    pub total_checkpoints: usize,
    pub incremental_checkpoints: usize,
    /// Sum of stored record sizes, after compression.
    pub total_bytes: u64,
    pub session_counts: BTreeMap<String, usize>,
    pub stage_counts: BTreeMap<String, usize>,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

impl CheckpointMetrics {
    pub(crate) fn record(&mut self, summary: &RecordSummary) {
        self.total_checkpoints += 1;
        if summary.incremental {
            self.incremental_checkpoints += 1;
        }
        self.total_bytes += summary.stored_bytes as u64;
        *self
            .session_counts
            .entry(summary.session_id.clone())
            .or_default() += 1;
        *self
            .stage_counts
            .entry(summary.stage_name.clone())
            .or_default() += 1;
        if self.last_checkpoint.is_none_or(|last| summary.timestamp > last) {
            self.last_checkpoint = Some(summary.timestamp);
        }
    }
}
