//! Checkpoint store: create, restore, list, expire.
//!
//! Records live in the `checkpoints` bucket under `{session_id}_{checkpoint_id}`.
//! A secondary `checkpoint_index` bucket maps each checkpoint id to that key
//! and is written in the same transaction as the record, so delete-by-id never
//! has to guess at key structure. Ownership of a record (for listing and
//! metrics) comes from the envelope's `session_id` metadata, which keeps
//! session ids that share a prefix (`app` vs `app_v2`) apart.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stevedore_types::{
    SessionDeltaV1, SessionSnapshot, SessionStateV1, WorkflowCheckpoint, WorkflowSession,
    WorkflowSpecRef,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{
    CheckpointEnvelope, META_CHECKPOINT_ID, META_COMPRESSION_MODE, META_INCREMENTAL, META_PARENT,
    META_SESSION_ID, META_STAGE_NAME, META_WORKFLOW_NAME, StoredRecord, key_checkpoint_id,
    key_session_id, primary_key,
};
use crate::error::{CheckpointError, Result};
use crate::kv::{CHECKPOINTS_BUCKET, INDEX_BUCKET, KvStore, SqliteKv};
use crate::metrics::{CheckpointMetrics, RecordSummary};
use crate::options::{CheckpointOptions, Clock, SystemClock};

/// Session state reconstructed from a checkpoint and its ancestors.
#[derive(Debug, Clone)]
struct Resolved {
    state: SessionStateV1,
    stage_results: BTreeMap<String, Value>,
    /// Checkpoint ids from the full base to the requested checkpoint.
    chain: Vec<String>,
}

/// Durable store of workflow checkpoints.
pub struct CheckpointStore<K: KvStore = SqliteKv> {
    kv: K,
    options: CheckpointOptions,
    clock: Arc<dyn Clock>,
}

impl<K: KvStore> std::fmt::Debug for CheckpointStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("options", &self.options)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Initialization
// ─────────────────────────────────────────────────────────────────────────────

impl CheckpointStore<SqliteKv> {
    /// Open or create a SQLite-backed store.
    pub fn open(path: impl AsRef<Path>, options: CheckpointOptions) -> Result<Self> {
        Ok(Self::new(SqliteKv::open(path)?, options))
    }

    /// Create a store on an in-memory SQLite database.
    pub fn open_in_memory(options: CheckpointOptions) -> Result<Self> {
        Ok(Self::new(SqliteKv::open_in_memory()?, options))
    }
}

impl<K: KvStore> CheckpointStore<K> {
    pub fn new(kv: K, options: CheckpointOptions) -> Self {
        Self {
            kv,
            options,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for timestamps and expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &CheckpointOptions {
        &self.options
    }

    /// Underlying key-value store.
    pub fn kv(&self) -> &K {
        &self.kv
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Create
// ─────────────────────────────────────────────────────────────────────────────

impl<K: KvStore> CheckpointStore<K> {
    /// Write a full snapshot of the session.
    pub fn create_checkpoint(
        &self,
        session: &WorkflowSession,
        stage_name: &str,
        message: &str,
        spec: Option<&WorkflowSpecRef>,
    ) -> Result<WorkflowCheckpoint> {
        let checkpoint = WorkflowCheckpoint {
            id: Uuid::new_v4().to_string(),
            stage_name: stage_name.to_string(),
            timestamp: self.clock.now(),
            workflow_spec: spec.cloned(),
            session_state: SessionSnapshot::Full(SessionStateV1::capture(session)),
            stage_results: session.stage_results.clone(),
            message: message.to_string(),
        };

        let stored = self.write(session, &checkpoint, None)?;

        info!(
            session_id = %session.id,
            checkpoint_id = %checkpoint.id,
            stage_name,
            stored_bytes = stored,
            "Created workflow checkpoint"
        );
        Ok(checkpoint)
    }

    /// Write only what changed since the session's latest checkpoint.
    ///
    /// Falls back to a full checkpoint when the session has none, or when the
    /// latest one can no longer be rebuilt.
    pub fn create_incremental_checkpoint(
        &self,
        session: &WorkflowSession,
        stage_name: &str,
        message: &str,
        spec: Option<&WorkflowSpecRef>,
    ) -> Result<WorkflowCheckpoint> {
        let latest = match self.get_latest_checkpoint(&session.id) {
            Ok(latest) => latest,
            Err(CheckpointError::NoCheckpoints(_)) => {
                debug!(
                    session_id = %session.id,
                    "No previous checkpoint; creating full checkpoint"
                );
                return self.create_checkpoint(session, stage_name, message, spec);
            }
            Err(e) => return Err(e),
        };

        let base = match self.resolve(&session.id, &latest) {
            Ok(base) => base,
            Err(e) if e.is_unreadable_record() => {
                warn!(
                    session_id = %session.id,
                    checkpoint_id = %latest.id,
                    error = %e,
                    "Latest checkpoint cannot be rebuilt; creating full checkpoint"
                );
                return self.create_checkpoint(session, stage_name, message, spec);
            }
            Err(e) => return Err(e),
        };
        let delta = SessionDeltaV1::between(&latest.id, &base.state, session);
        let stage_results: BTreeMap<String, Value> = session
            .stage_results
            .iter()
            .filter(|(stage, result)| base.stage_results.get(*stage) != Some(*result))
            .map(|(stage, result)| (stage.clone(), result.clone()))
            .collect();

        let checkpoint = WorkflowCheckpoint {
            id: Uuid::new_v4().to_string(),
            stage_name: stage_name.to_string(),
            timestamp: self.clock.now(),
            workflow_spec: spec.cloned(),
            session_state: SessionSnapshot::Delta(delta),
            stage_results,
            message: message.to_string(),
        };

        let stored = self.write(session, &checkpoint, Some(&latest.id))?;

        info!(
            session_id = %session.id,
            checkpoint_id = %checkpoint.id,
            parent_checkpoint = %latest.id,
            stage_name,
            changed_results = checkpoint.stage_results.len(),
            stored_bytes = stored,
            "Created incremental workflow checkpoint"
        );
        Ok(checkpoint)
    }

    /// Seal and store a checkpoint plus its index entry in one transaction.
    fn write(
        &self,
        session: &WorkflowSession,
        checkpoint: &WorkflowCheckpoint,
        parent: Option<&str>,
    ) -> Result<usize> {
        let payload = serde_json::to_vec(checkpoint)?;

        let mut metadata = BTreeMap::from([
            (META_SESSION_ID.to_string(), session.id.clone()),
            (META_STAGE_NAME.to_string(), checkpoint.stage_name.clone()),
            (META_WORKFLOW_NAME.to_string(), session.workflow_name.clone()),
            (
                META_COMPRESSION_MODE.to_string(),
                self.options.compression.mode_name().to_string(),
            ),
            (META_CHECKPOINT_ID.to_string(), checkpoint.id.clone()),
        ]);
        if let Some(parent) = parent {
            metadata.insert(META_INCREMENTAL.to_string(), "true".to_string());
            metadata.insert(META_PARENT.to_string(), parent.to_string());
        }

        let envelope = CheckpointEnvelope::seal(
            &payload,
            self.options.compression,
            self.options.integrity,
            checkpoint.timestamp,
            metadata,
        )?;
        let record = serde_json::to_vec(&envelope)?;
        let key = primary_key(&session.id, &checkpoint.id);

        self.kv.update(|txn| {
            txn.put(CHECKPOINTS_BUCKET, key.as_bytes(), &record)?;
            txn.put(INDEX_BUCKET, checkpoint.id.as_bytes(), key.as_bytes())
        })?;

        Ok(record.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read
// ─────────────────────────────────────────────────────────────────────────────

impl<K: KvStore> CheckpointStore<K> {
    /// Decode a single checkpoint without reconstructing a session.
    pub fn get_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<WorkflowCheckpoint> {
        let key = primary_key(session_id, checkpoint_id);
        let bytes = self
            .kv
            .view(|txn| txn.get(CHECKPOINTS_BUCKET, key.as_bytes()))?
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.to_string()))?;

        StoredRecord::parse(&key, &bytes)?.into_checkpoint(self.options.restore_policy, &key)
    }

    /// Rebuild a session from a checkpoint.
    ///
    /// Incremental checkpoints are replayed on top of their ancestors, back
    /// to the nearest full checkpoint.
    pub fn restore_from_checkpoint(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<WorkflowSession> {
        let checkpoint = self.get_checkpoint(session_id, checkpoint_id)?;
        self.rebuild(session_id, &checkpoint)
    }

    /// Rebuild a session from its newest checkpoint that can still be
    /// restored.
    ///
    /// Checkpoints that are unreadable, or whose ancestry is, are logged and
    /// passed over for the next newest. If none can be restored, the error
    /// from the newest is returned.
    pub fn restore_latest(&self, session_id: &str) -> Result<WorkflowSession> {
        let mut first_error = None;
        for checkpoint in self.list_checkpoints(session_id)? {
            match self.rebuild(session_id, &checkpoint) {
                Ok(session) => {
                    if first_error.is_some() {
                        warn!(
                            session_id,
                            checkpoint_id = %checkpoint.id,
                            "Restored from an older checkpoint"
                        );
                    }
                    return Ok(session);
                }
                Err(e) if e.is_unreadable_record() => {
                    warn!(
                        session_id,
                        checkpoint_id = %checkpoint.id,
                        error = %e,
                        "Skipping checkpoint that cannot be restored"
                    );
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(first_error.unwrap_or_else(|| CheckpointError::NoCheckpoints(session_id.to_string())))
    }

    fn rebuild(&self, session_id: &str, checkpoint: &WorkflowCheckpoint) -> Result<WorkflowSession> {
        let resolved = self.resolve(session_id, checkpoint)?;

        let mut session = resolved
            .state
            .into_session(resolved.stage_results, checkpoint.timestamp);
        if session.id.is_empty() {
            session.id = session_id.to_string();
        }
        session.checkpoints = resolved.chain;

        info!(
            session_id,
            checkpoint_id = %checkpoint.id,
            stage_name = %checkpoint.stage_name,
            replayed = session.checkpoints.len(),
            "Restored session from checkpoint"
        );
        Ok(session)
    }

    /// All checkpoints for a session, newest first.
    ///
    /// Unreadable records are logged and left out.
    pub fn list_checkpoints(&self, session_id: &str) -> Result<Vec<WorkflowCheckpoint>> {
        let prefix = format!("{session_id}_");
        let entries = self
            .kv
            .view(|txn| txn.scan_prefix(CHECKPOINTS_BUCKET, prefix.as_bytes()))?;

        let mut checkpoints = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            let key = String::from_utf8_lossy(&key).into_owned();
            let record = match StoredRecord::parse(&key, &bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable checkpoint in listing");
                    continue;
                }
            };
            if record_session(&record, &key) != session_id {
                continue;
            }
            match record.into_checkpoint(self.options.restore_policy, &key) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable checkpoint in listing"),
            }
        }

        checkpoints.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(checkpoints)
    }

    /// Most recent readable checkpoint for a session.
    pub fn get_latest_checkpoint(&self, session_id: &str) -> Result<WorkflowCheckpoint> {
        let prefix = format!("{session_id}_");
        let latest = self.kv.view(|txn| {
            let entries = txn.scan_prefix(CHECKPOINTS_BUCKET, prefix.as_bytes())?;
            let mut latest: Option<RecordSummary> = None;
            for (key, bytes) in entries {
                let key = String::from_utf8_lossy(&key);
                let summary = match summarize(&key, &bytes) {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Skipping unreadable checkpoint");
                        continue;
                    }
                };
                if summary.session_id != session_id {
                    continue;
                }
                if latest
                    .as_ref()
                    .is_none_or(|current| summary.timestamp > current.timestamp)
                {
                    latest = Some(summary);
                }
            }
            Ok(latest)
        })?;

        match latest {
            Some(summary) => self.get_checkpoint(session_id, &summary.checkpoint_id),
            None => Err(CheckpointError::NoCheckpoints(session_id.to_string())),
        }
    }

    /// Walk parents back to a full checkpoint and replay forward.
    fn resolve(&self, session_id: &str, checkpoint: &WorkflowCheckpoint) -> Result<Resolved> {
        let mut deltas: Vec<WorkflowCheckpoint> = Vec::new();
        let mut seen = HashSet::new();
        let mut current = checkpoint.clone();

        let (mut state, mut stage_results) = loop {
            if !seen.insert(current.id.clone()) {
                return Err(CheckpointError::Corrupt {
                    key: primary_key(session_id, &current.id),
                    reason: "checkpoint chain loops back on itself".to_string(),
                });
            }

            let parent_id = match &current.session_state {
                SessionSnapshot::Full(state) => {
                    break (state.clone(), current.stage_results.clone());
                }
                SessionSnapshot::Delta(delta) => delta.parent_checkpoint.clone(),
            };

            let parent = match self.get_checkpoint(session_id, &parent_id) {
                Ok(parent) => parent,
                Err(CheckpointError::NotFound(_)) => {
                    return Err(CheckpointError::BrokenChain {
                        checkpoint_id: current.id.clone(),
                        missing_parent: parent_id,
                    });
                }
                Err(e) => return Err(e),
            };
            deltas.push(std::mem::replace(&mut current, parent));
        };

        let mut chain = vec![current.id];
        for checkpoint in deltas.into_iter().rev() {
            if let SessionSnapshot::Delta(delta) = &checkpoint.session_state {
                state.apply(delta);
            }
            stage_results.extend(checkpoint.stage_results);
            chain.push(checkpoint.id);
        }

        Ok(Resolved {
            state,
            stage_results,
            chain,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delete and expire
// ─────────────────────────────────────────────────────────────────────────────

impl<K: KvStore> CheckpointStore<K> {
    /// Delete one checkpoint by id.
    ///
    /// Deleting a checkpoint that incremental checkpoints build on leaves
    /// those descendants unrestorable.
    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let deleted = self.kv.update(|txn| {
            if let Some(primary) = txn.get(INDEX_BUCKET, checkpoint_id.as_bytes())? {
                let existed = txn.delete(CHECKPOINTS_BUCKET, &primary)?;
                txn.delete(INDEX_BUCKET, checkpoint_id.as_bytes())?;
                return Ok(existed);
            }

            // Records written before the index existed.
            let unindexed: Vec<Vec<u8>> = txn
                .scan_prefix(CHECKPOINTS_BUCKET, b"")?
                .into_iter()
                .map(|(key, _)| key)
                .filter(|key| key_checkpoint_id(&String::from_utf8_lossy(key)) == checkpoint_id)
                .collect();
            for key in &unindexed {
                txn.delete(CHECKPOINTS_BUCKET, key)?;
            }
            Ok(!unindexed.is_empty())
        })?;

        if !deleted {
            return Err(CheckpointError::NotFound(checkpoint_id.to_string()));
        }
        info!(checkpoint_id, "Deleted workflow checkpoint");
        Ok(())
    }

    /// Delete every checkpoint of a session atomically. Returns the count.
    pub fn delete_session_checkpoints(&self, session_id: &str) -> Result<usize> {
        let prefix = format!("{session_id}_");
        let deleted = self.kv.update(|txn| {
            let entries = txn.scan_prefix(CHECKPOINTS_BUCKET, prefix.as_bytes())?;
            let mut deleted = 0;
            for (key, bytes) in entries {
                let key_str = String::from_utf8_lossy(&key).into_owned();
                let (owner, checkpoint_id) = match summarize(&key_str, &bytes) {
                    Ok(summary) => (summary.session_id, summary.checkpoint_id),
                    Err(_) => (
                        key_session_id(&key_str).to_string(),
                        key_checkpoint_id(&key_str).to_string(),
                    ),
                };
                if owner != session_id {
                    continue;
                }
                if txn.delete(CHECKPOINTS_BUCKET, &key)? {
                    deleted += 1;
                }
                txn.delete(INDEX_BUCKET, checkpoint_id.as_bytes())?;
            }
            Ok(deleted)
        })?;

        info!(session_id, deleted, "Deleted session checkpoints");
        Ok(deleted)
    }

    /// Delete checkpoints strictly older than `now - max_age`.
    ///
    /// An expired checkpoint that a live incremental checkpoint builds on is
    /// kept until its descendants expire too. Runs a read pass to find
    /// candidates, then a write pass. A key that fails to delete is logged
    /// and skipped.
    pub fn cleanup_expired_checkpoints(&self, max_age: Duration) -> Result<usize> {
        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let summaries: Vec<RecordSummary> = self.kv.view(|txn| {
            let mut summaries = Vec::new();
            for (key, bytes) in txn.scan_prefix(CHECKPOINTS_BUCKET, b"")? {
                let key = String::from_utf8_lossy(&key).into_owned();
                match summarize(&key, &bytes) {
                    Ok(summary) => summaries.push(summary),
                    Err(e) => warn!(key = %key, error = %e, "Skipping unreadable checkpoint during cleanup"),
                }
            }
            Ok(summaries)
        })?;

        let (expired, retained) = expired_records(summaries, cutoff);
        if retained > 0 {
            debug!(retained, "Keeping expired checkpoints that live checkpoints build on");
        }
        if expired.is_empty() {
            debug!(cutoff = %cutoff, "No expired checkpoints");
            return Ok(0);
        }

        let deleted = self.kv.update(|txn| {
            let mut deleted = 0;
            for summary in &expired {
                match txn.delete(CHECKPOINTS_BUCKET, summary.key.as_bytes()) {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %summary.key, error = %e, "Failed to delete expired checkpoint");
                        continue;
                    }
                }
                if let Err(e) = txn.delete(INDEX_BUCKET, summary.checkpoint_id.as_bytes()) {
                    warn!(
                        checkpoint_id = %summary.checkpoint_id,
                        error = %e,
                        "Failed to delete checkpoint index entry"
                    );
                }
            }
            Ok(deleted)
        })?;

        info!(deleted, cutoff = %cutoff, "Cleaned up expired checkpoints");
        Ok(deleted)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Maintenance
// ─────────────────────────────────────────────────────────────────────────────

impl<K: KvStore> CheckpointStore<K> {
    /// Aggregate counts over every stored checkpoint.
    ///
    /// Unreadable records are logged and left out.
    pub fn get_checkpoint_metrics(&self) -> Result<CheckpointMetrics> {
        self.kv.view(|txn| {
            let mut metrics = CheckpointMetrics::default();
            for (key, bytes) in txn.scan_prefix(CHECKPOINTS_BUCKET, b"")? {
                let key = String::from_utf8_lossy(&key).into_owned();
                match summarize(&key, &bytes) {
                    Ok(summary) => metrics.record(&summary),
                    Err(e) => warn!(key = %key, error = %e, "Skipping unreadable checkpoint in metrics"),
                }
            }
            Ok(metrics)
        })
    }

    /// Backfill the id index for records that lack an entry.
    ///
    /// Returns the number of entries written.
    pub fn rebuild_index(&self) -> Result<usize> {
        let written = self.kv.update(|txn| {
            let mut written = 0;
            for (key, bytes) in txn.scan_prefix(CHECKPOINTS_BUCKET, b"")? {
                let key_str = String::from_utf8_lossy(&key).into_owned();
                let checkpoint_id = match summarize(&key_str, &bytes) {
                    Ok(summary) => summary.checkpoint_id,
                    Err(_) => key_checkpoint_id(&key_str).to_string(),
                };
                let current = txn.get(INDEX_BUCKET, checkpoint_id.as_bytes())?;
                if current.as_deref() != Some(key.as_slice()) {
                    txn.put(INDEX_BUCKET, checkpoint_id.as_bytes(), &key)?;
                    written += 1;
                }
            }
            Ok(written)
        })?;

        info!(written, "Rebuilt checkpoint index");
        Ok(written)
    }
}

/// Expired records safe to delete, and how many expired records were kept
/// because a live checkpoint descends from them.
fn expired_records(
    summaries: Vec<RecordSummary>,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> (Vec<RecordSummary>, usize) {
    let parents: HashMap<&str, &str> = summaries
        .iter()
        .filter_map(|s| Some((s.checkpoint_id.as_str(), s.parent.as_deref()?)))
        .collect();

    let mut ancestors: HashSet<String> = HashSet::new();
    for summary in summaries.iter().filter(|s| s.timestamp >= cutoff) {
        let mut parent = summary.parent.as_deref();
        while let Some(id) = parent {
            if !ancestors.insert(id.to_string()) {
                break;
            }
            parent = parents.get(id).copied();
        }
    }

    let (kept, expired): (Vec<_>, Vec<_>) = summaries
        .into_iter()
        .filter(|s| s.timestamp < cutoff)
        .partition(|s| ancestors.contains(&s.checkpoint_id));
    (expired, kept.len())
}

/// Session that owns a record.
fn record_session(record: &StoredRecord, key: &str) -> String {
    let recorded = match record {
        StoredRecord::Envelope(envelope) => envelope.metadata(META_SESSION_ID),
        StoredRecord::Legacy(checkpoint) => checkpoint.session_state.session_id(),
    };
    match recorded {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => key_session_id(key).to_string(),
    }
}

/// Summarize a record, decoding the payload only for legacy records.
fn summarize(key: &str, bytes: &[u8]) -> Result<RecordSummary> {
    let record = StoredRecord::parse(key, bytes)?;
    let session_id = record_session(&record, key);

    let summary = match record {
        StoredRecord::Envelope(envelope) => RecordSummary {
            key: key.to_string(),
            checkpoint_id: envelope
                .metadata(META_CHECKPOINT_ID)
                .unwrap_or_else(|| key_checkpoint_id(key))
                .to_string(),
            session_id,
            stage_name: envelope
                .metadata(META_STAGE_NAME)
                .unwrap_or_default()
                .to_string(),
            timestamp: envelope.created_at,
            incremental: envelope.is_incremental(),
            parent: envelope.metadata(META_PARENT).map(str::to_string),
            stored_bytes: bytes.len(),
        },
        StoredRecord::Legacy(checkpoint) => RecordSummary {
            key: key.to_string(),
            checkpoint_id: checkpoint.id.clone(),
            session_id,
            stage_name: checkpoint.stage_name.clone(),
            timestamp: checkpoint.timestamp,
            incremental: checkpoint.is_incremental(),
            parent: checkpoint.parent_id().map(str::to_string),
            stored_bytes: bytes.len(),
        },
    };
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::options::{ManualClock, RestorePolicy};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use stevedore_types::WorkflowStatus;

    fn store() -> CheckpointStore<MemoryKv> {
        CheckpointStore::new(MemoryKv::new(), CheckpointOptions::default())
    }

    fn session(id: &str) -> WorkflowSession {
        let mut session = WorkflowSession::with_id(id, "wf-1", "containerize");
        session.start_stage("analyze").unwrap();
        session
            .complete_stage("analyze", json!({"language": "rust", "port": 8080}))
            .unwrap();
        session.set_context("registry", json!("ghcr.io/acme"));
        session.start_stage("build_image").unwrap();
        session
    }

    #[test]
    fn test_roundtrip_full_checkpoint() {
        let store = store();
        let original = session("sess-1");
        let spec = WorkflowSpecRef::new("spec-1", "containerize", "v1");

        let cp = store
            .create_checkpoint(&original, "build_image", "before build", Some(&spec))
            .unwrap();
        let restored = store.restore_from_checkpoint("sess-1", &cp.id).unwrap();

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.status, WorkflowStatus::Running);
        assert_eq!(restored.current_stage.as_deref(), Some("build_image"));
        assert_eq!(restored.completed_stages, original.completed_stages);
        assert_eq!(restored.stage_results, original.stage_results);
        assert_eq!(restored.shared_context, original.shared_context);
        assert_eq!(restored.updated_at, cp.timestamp);
        assert_eq!(restored.checkpoints, vec![cp.id.clone()]);

        let fetched = store.get_checkpoint("sess-1", &cp.id).unwrap();
        assert_eq!(fetched.workflow_spec, Some(spec));
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let store = CheckpointStore::new(
            MemoryKv::new(),
            CheckpointOptions::default().without_compression(),
        );
        let original = session("sess-1");
        let cp = store.create_checkpoint(&original, "build", "", None).unwrap();
        let restored = store.restore_from_checkpoint("sess-1", &cp.id).unwrap();
        assert_eq!(restored.stage_results, original.stage_results);
        assert_eq!(restored.workflow_name, "containerize");
    }

    #[test]
    fn test_incremental_without_parent_is_full() {
        let store = store();
        let original = session("sess-1");

        let cp = store
            .create_incremental_checkpoint(&original, "build", "first", None)
            .unwrap();
        assert!(!cp.is_incremental());

        let full_store = self::store();
        let full = full_store.create_checkpoint(&original, "build", "first", None).unwrap();

        let a = store.restore_from_checkpoint("sess-1", &cp.id).unwrap();
        let b = full_store.restore_from_checkpoint("sess-1", &full.id).unwrap();
        assert_eq!(
            SessionStateV1::capture(&a),
            SessionStateV1::capture(&b)
        );
        assert_eq!(a.stage_results, b.stage_results);
    }

    #[test]
    fn test_incremental_chain_replays() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()));
        let store = store().with_clock(clock.clone());
        let mut live = session("sess-1");

        let base = store.create_checkpoint(&live, "build", "base", None).unwrap();

        clock.advance(chrono::Duration::seconds(10));
        live.complete_stage("build_image", json!({"image": "acme/app:1"})).unwrap();
        live.bind_resource("image_ref", "acme/app:1");
        let first = store
            .create_incremental_checkpoint(&live, "scan", "after build", None)
            .unwrap();
        assert_eq!(first.parent_id(), Some(base.id.as_str()));
        assert_eq!(first.stage_results.len(), 1);
        assert!(first.stage_results.contains_key("build_image"));

        clock.advance(chrono::Duration::seconds(10));
        live.start_stage("scan_security").unwrap();
        let second = store
            .create_incremental_checkpoint(&live, "scan", "scanning", None)
            .unwrap();
        assert_eq!(second.parent_id(), Some(first.id.as_str()));
        assert!(second.stage_results.is_empty());

        let restored = store.restore_from_checkpoint("sess-1", &second.id).unwrap();
        assert_eq!(SessionStateV1::capture(&restored), SessionStateV1::capture(&live));
        assert_eq!(restored.stage_results, live.stage_results);
        assert_eq!(restored.checkpoints, vec![base.id, first.id, second.id]);

        let metrics = store.get_checkpoint_metrics().unwrap();
        assert_eq!(metrics.total_checkpoints, 3);
        assert_eq!(metrics.incremental_checkpoints, 2);
    }

    #[test]
    fn test_broken_chain() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store().with_clock(clock.clone());
        let mut live = session("sess-1");

        let base = store.create_checkpoint(&live, "build", "", None).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        live.fail_stage("build_image").unwrap();
        let delta = store.create_incremental_checkpoint(&live, "build", "", None).unwrap();

        store.delete_checkpoint(&base.id).unwrap();
        let err = store.restore_from_checkpoint("sess-1", &delta.id).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::BrokenChain { ref missing_parent, .. } if *missing_parent == base.id
        ));
    }

    #[test]
    fn test_list_newest_first_and_latest() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let store = store().with_clock(clock.clone());
        let live = session("sess-1");

        let mut ids = Vec::new();
        for stage in ["analyze", "build", "scan"] {
            ids.push(store.create_checkpoint(&live, stage, "", None).unwrap().id);
            clock.advance(chrono::Duration::minutes(1));
        }

        let listed: Vec<_> = store
            .list_checkpoints("sess-1")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        ids.reverse();
        assert_eq!(listed, ids);
        assert_eq!(store.get_latest_checkpoint("sess-1").unwrap().id, ids[0]);
    }

    #[test]
    fn test_latest_without_checkpoints() {
        let err = store().get_latest_checkpoint("ghost").unwrap_err();
        assert!(matches!(err, CheckpointError::NoCheckpoints(ref id) if id == "ghost"));
    }

    #[test]
    fn test_prefix_collision_is_filtered() {
        let store = store();
        store.create_checkpoint(&session("app"), "a", "", None).unwrap();
        store.create_checkpoint(&session("app_v2"), "b", "", None).unwrap();
        store.create_checkpoint(&session("app_v2"), "c", "", None).unwrap();

        assert_eq!(store.list_checkpoints("app").unwrap().len(), 1);
        assert_eq!(store.list_checkpoints("app_v2").unwrap().len(), 2);

        let metrics = store.get_checkpoint_metrics().unwrap();
        assert_eq!(metrics.session_counts["app"], 1);
        assert_eq!(metrics.session_counts["app_v2"], 2);

        assert_eq!(store.delete_session_checkpoints("app").unwrap(), 1);
        assert_eq!(store.list_checkpoints("app_v2").unwrap().len(), 2);
    }

    #[test]
    fn test_delete_checkpoint_by_id() {
        let store = store();
        let cp = store.create_checkpoint(&session("s"), "a", "", None).unwrap();

        store.delete_checkpoint(&cp.id).unwrap();
        assert!(store.list_checkpoints("s").unwrap().is_empty());
        assert!(matches!(
            store.delete_checkpoint(&cp.id).unwrap_err(),
            CheckpointError::NotFound(_)
        ));
    }

    #[test]
    fn test_legacy_record_restores_and_indexes() {
        let store = store();
        let legacy = json!({
            "id": "4f1d2c3b-0000-4000-8000-000000000001",
            "stage_name": "build",
            "timestamp": "2024-11-20T08:30:00Z",
            "session_state": {
                "session_id": "old-sess",
                "workflow_name": "containerize",
                "status": "running",
                "current_stage": "build",
                "completed_stages": ["analyze"],
            },
            "stage_results": {"analyze": {"language": "go"}},
            "message": "pre-envelope"
        });
        let key = primary_key("old-sess", "4f1d2c3b-0000-4000-8000-000000000001");
        store
            .kv()
            .update(|txn| {
                txn.put(
                    CHECKPOINTS_BUCKET,
                    key.as_bytes(),
                    &serde_json::to_vec(&legacy).unwrap(),
                )
            })
            .unwrap();

        let restored = store
            .restore_from_checkpoint("old-sess", "4f1d2c3b-0000-4000-8000-000000000001")
            .unwrap();
        assert_eq!(restored.status, WorkflowStatus::Running);
        assert_eq!(restored.workflow_id, "");
        assert_eq!(restored.stage_results["analyze"]["language"], "go");

        assert_eq!(store.rebuild_index().unwrap(), 1);
        assert_eq!(store.rebuild_index().unwrap(), 0);
        store
            .delete_checkpoint("4f1d2c3b-0000-4000-8000-000000000001")
            .unwrap();
    }

    #[test]
    fn test_unindexed_record_deleted_by_suffix() {
        let store = store();
        let cp = store.create_checkpoint(&session("s"), "a", "", None).unwrap();
        store
            .kv()
            .update(|txn| txn.delete(INDEX_BUCKET, cp.id.as_bytes()))
            .unwrap();

        store.delete_checkpoint(&cp.id).unwrap();
        assert!(store.list_checkpoints("s").unwrap().is_empty());
    }

    #[test]
    fn test_strict_policy_rejects_tampered_record() {
        let strict = CheckpointStore::new(
            MemoryKv::new(),
            CheckpointOptions::default().with_restore_policy(RestorePolicy::Strict),
        );
        let cp = strict.create_checkpoint(&session("s"), "a", "", None).unwrap();
        tamper_checksum(strict.kv(), &primary_key("s", &cp.id));

        let err = strict.restore_from_checkpoint("s", &cp.id).unwrap_err();
        assert!(matches!(err, CheckpointError::Integrity { .. }));
    }

    #[test]
    fn test_best_effort_policy_restores_tampered_record() {
        let store = store();
        let cp = store.create_checkpoint(&session("s"), "a", "", None).unwrap();
        tamper_checksum(store.kv(), &primary_key("s", &cp.id));

        let restored = store.restore_from_checkpoint("s", &cp.id).unwrap();
        assert_eq!(restored.id, "s");
    }

    fn tamper_checksum(kv: &MemoryKv, key: &str) {
        kv.update(|txn| {
            let bytes = txn.get(CHECKPOINTS_BUCKET, key.as_bytes())?.unwrap();
            let mut envelope: Value = serde_json::from_slice(&bytes)?;
            envelope["checksum"] = json!("deadbeef");
            txn.put(CHECKPOINTS_BUCKET, key.as_bytes(), &serde_json::to_vec(&envelope)?)
        })
        .unwrap();
    }

    #[test]
    fn test_cleanup_removes_strictly_older() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = store().with_clock(clock.clone());
        let live = session("s");

        // Checkpoints at t=0h, 1h, 2h, 3h.
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(store.create_checkpoint(&live, "a", "", None).unwrap().id);
            clock.advance(chrono::Duration::hours(1));
        }

        // now = 4h; cutoff = 2h. Only 0h and 1h are strictly older.
        clock.set(start + chrono::Duration::hours(4));
        let removed = store
            .cleanup_expired_checkpoints(Duration::from_secs(2 * 3600))
            .unwrap();
        assert_eq!(removed, 2);

        let mut remaining: Vec<_> = store
            .list_checkpoints("s")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        remaining.sort();
        let mut expected = ids[2..].to_vec();
        expected.sort();
        assert_eq!(remaining, expected);

        // Running again changes nothing.
        assert_eq!(
            store
                .cleanup_expired_checkpoints(Duration::from_secs(2 * 3600))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_cleanup_keeps_base_of_live_incremental_chain() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = store().with_clock(clock.clone());
        let mut live = session("s");

        let base = store
            .create_incremental_checkpoint(&live, "build", "first", None)
            .unwrap();
        assert!(!base.is_incremental());

        clock.advance(chrono::Duration::hours(2));
        live.complete_stage("build_image", json!({"image": "acme/app:2"})).unwrap();
        let delta = store
            .create_incremental_checkpoint(&live, "scan", "", None)
            .unwrap();
        assert_eq!(delta.parent_id(), Some(base.id.as_str()));

        let one_hour = Duration::from_secs(3600);
        assert_eq!(store.cleanup_expired_checkpoints(one_hour).unwrap(), 0);

        let restored = store.restore_latest("s").unwrap();
        assert_eq!(restored.checkpoints, vec![base.id.clone(), delta.id.clone()]);
        assert_eq!(restored.stage_results, live.stage_results);

        clock.advance(chrono::Duration::minutes(1));
        live.start_stage("scan_security").unwrap();
        let next = store
            .create_incremental_checkpoint(&live, "scan", "", None)
            .unwrap();
        assert_eq!(next.parent_id(), Some(delta.id.as_str()));

        // Once the whole chain is old it goes together.
        clock.advance(chrono::Duration::hours(5));
        assert_eq!(store.cleanup_expired_checkpoints(one_hour).unwrap(), 3);
        assert!(store.list_checkpoints("s").unwrap().is_empty());
    }

    #[test]
    fn test_incremental_after_lost_base_writes_full() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()));
        let store = store().with_clock(clock.clone());
        let mut live = session("s");

        let base = store.create_checkpoint(&live, "build", "", None).unwrap();
        clock.advance(chrono::Duration::minutes(1));
        live.fail_stage("build_image").unwrap();
        store.create_incremental_checkpoint(&live, "build", "", None).unwrap();
        store.delete_checkpoint(&base.id).unwrap();

        clock.advance(chrono::Duration::minutes(1));
        let next = store
            .create_incremental_checkpoint(&live, "build", "after loss", None)
            .unwrap();
        assert!(!next.is_incremental());

        let restored = store.restore_latest("s").unwrap();
        assert_eq!(restored.checkpoints, vec![next.id]);
        assert_eq!(restored.failed_stages, live.failed_stages);
    }

    #[test]
    fn test_restore_latest_falls_back_past_broken_chain() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()));
        let store = store().with_clock(clock.clone());
        let mut live = session("s");

        let a = store.create_checkpoint(&live, "build", "", None).unwrap();
        clock.advance(chrono::Duration::minutes(1));
        live.complete_stage("build_image", json!({"image": "acme/app:3"})).unwrap();
        let b = store.create_incremental_checkpoint(&live, "scan", "", None).unwrap();

        clock.advance(chrono::Duration::minutes(1));
        let c = store.create_checkpoint(&live, "scan", "", None).unwrap();
        clock.advance(chrono::Duration::minutes(1));
        live.start_stage("scan_security").unwrap();
        let d = store.create_incremental_checkpoint(&live, "scan", "", None).unwrap();
        assert_eq!(d.parent_id(), Some(c.id.as_str()));

        store.delete_checkpoint(&c.id).unwrap();
        let restored = store.restore_latest("s").unwrap();
        assert_eq!(restored.checkpoints, vec![a.id.clone(), b.id.clone()]);
        assert_eq!(restored.stage_results["build_image"]["image"], "acme/app:3");

        store.delete_checkpoint(&a.id).unwrap();
        let err = store.restore_latest("s").unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::BrokenChain { ref checkpoint_id, .. } if *checkpoint_id == d.id
        ));
    }

    #[test]
    fn test_unreadable_record_does_not_block_session() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()));
        let store = store().with_clock(clock.clone());
        let live = session("s");

        store.create_checkpoint(&live, "analyze", "", None).unwrap();
        clock.advance(chrono::Duration::minutes(1));
        let newest = store.create_checkpoint(&live, "build", "", None).unwrap();
        store
            .kv()
            .update(|txn| txn.put(CHECKPOINTS_BUCKET, b"s_garbage", b"{not json"))
            .unwrap();

        assert_eq!(store.list_checkpoints("s").unwrap().len(), 2);
        assert_eq!(store.get_latest_checkpoint("s").unwrap().id, newest.id);
        assert_eq!(store.restore_latest("s").unwrap().checkpoints, vec![newest.id]);
    }

    #[test]
    fn test_restore_latest_without_checkpoints() {
        let err = store().restore_latest("ghost").unwrap_err();
        assert!(matches!(err, CheckpointError::NoCheckpoints(_)));
    }

    #[test]
    fn test_cleanup_with_huge_age_is_noop() {
        let store = store();
        store.create_checkpoint(&session("s"), "a", "", None).unwrap();
        assert_eq!(
            store.cleanup_expired_checkpoints(Duration::MAX).unwrap(),
            0
        );
    }
}
