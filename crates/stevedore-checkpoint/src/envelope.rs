//! Durable record format for checkpoints.
//!
//! A stored record is JSON. Current records are envelopes:
//!
//! ```json
//! {"version": 1, "compressed": true, "checksum": "ab12..", "data_size": 5120,
//!  "created_at": "2025-06-01T12:00:00Z", "metadata": {"session_id": ".."},
//!  "data": "<base64>"}
//! ```
//!
//! `version` is checked before any other field. Records without it are the
//! pre-envelope format: the checkpoint JSON itself, uncompressed and without
//! a checksum.

use std::collections::BTreeMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use stevedore_types::WorkflowCheckpoint;
use tracing::{debug, warn};

use crate::error::{CheckpointError, Result};
use crate::options::{Compression, RestorePolicy};

/// Envelope format version written by this crate.
pub const ENVELOPE_VERSION: u32 = 1;

pub const META_SESSION_ID: &str = "session_id";
pub const META_STAGE_NAME: &str = "stage_name";
pub const META_WORKFLOW_NAME: &str = "workflow_name";
pub const META_COMPRESSION_MODE: &str = "compression_mode";
pub const META_CHECKPOINT_ID: &str = "checkpoint_id";
pub const META_INCREMENTAL: &str = "incremental";
pub const META_PARENT: &str = "parent_checkpoint";

/// Largest uncompressed payload an envelope may claim.
pub const MAX_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Wrapper around stored checkpoint bytes.
///
/// If `compressed` is set, `data.len() < data_size` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub version: u32,
    pub compressed: bool,
    /// Hex SHA-256 over `data` as stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Length of the uncompressed payload.
    pub data_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl CheckpointEnvelope {
    /// Wrap a serialized checkpoint.
    ///
    /// Compression is kept only when it makes the payload strictly smaller.
    pub fn seal(
        payload: &[u8],
        compression: Compression,
        integrity: bool,
        created_at: DateTime<Utc>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self> {
        let (data, compressed) = match compression {
            Compression::None => (payload.to_vec(), false),
            Compression::Zstd { level } => {
                let packed = zstd::bulk::compress(payload, level).map_err(|source| {
                    CheckpointError::Compression {
                        checkpoint_id: metadata
                            .get(META_CHECKPOINT_ID)
                            .cloned()
                            .unwrap_or_default(),
                        source,
                    }
                })?;
                if packed.len() < payload.len() {
                    (packed, true)
                } else {
                    debug!(
                        original = payload.len(),
                        compressed = packed.len(),
                        "Compression did not shrink payload; storing raw"
                    );
                    (payload.to_vec(), false)
                }
            }
        };

        let checksum = integrity.then(|| checksum(&data));

        Ok(Self {
            version: ENVELOPE_VERSION,
            compressed,
            checksum,
            data_size: payload.len() as u64,
            created_at,
            metadata,
            data,
        })
    }

    /// Verify and unpack the payload.
    ///
    /// A checksum mismatch fails under [`RestorePolicy::Strict`] and is logged
    /// under [`RestorePolicy::BestEffort`].
    pub fn open(&self, policy: RestorePolicy, checkpoint_id: &str) -> Result<Vec<u8>> {
        if let Some(expected) = &self.checksum {
            let actual = checksum(&self.data);
            if !actual.eq_ignore_ascii_case(expected) {
                match policy {
                    RestorePolicy::Strict => {
                        return Err(CheckpointError::Integrity {
                            checkpoint_id: checkpoint_id.to_string(),
                            expected: expected.clone(),
                            actual,
                        });
                    }
                    RestorePolicy::BestEffort => {
                        warn!(
                            checkpoint_id,
                            expected = %expected,
                            actual = %actual,
                            "Checkpoint checksum mismatch; restoring anyway"
                        );
                    }
                }
            }
        }

        if !self.compressed {
            return Ok(self.data.clone());
        }

        if self.data_size > MAX_PAYLOAD_BYTES {
            return Err(CheckpointError::Corrupt {
                key: checkpoint_id.to_string(),
                reason: format!(
                    "data_size {} exceeds limit of {MAX_PAYLOAD_BYTES} bytes",
                    self.data_size
                ),
            });
        }

        // Stream so the buffer grows with the real output, never with the
        // recorded size.
        let compression_error = |source| CheckpointError::Compression {
            checkpoint_id: checkpoint_id.to_string(),
            source,
        };
        let mut payload = Vec::new();
        zstd::stream::read::Decoder::new(self.data.as_slice())
            .map_err(compression_error)?
            .take(self.data_size.saturating_add(1))
            .read_to_end(&mut payload)
            .map_err(compression_error)?;

        if payload.len() as u64 != self.data_size {
            return Err(CheckpointError::Corrupt {
                key: checkpoint_id.to_string(),
                reason: format!(
                    "payload decompressed to {} bytes, envelope records {}",
                    payload.len(),
                    self.data_size
                ),
            });
        }
        Ok(payload)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_incremental(&self) -> bool {
        self.metadata(META_INCREMENTAL) == Some("true")
    }
}

fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ─────────────────────────────────────────────────────────────────────────────
// Stored records
// ─────────────────────────────────────────────────────────────────────────────

/// A record as read from storage.
#[derive(Debug, Clone)]
pub enum StoredRecord {
    Envelope(CheckpointEnvelope),
    Legacy(Box<WorkflowCheckpoint>),
}

impl StoredRecord {
    /// Interpret raw bytes stored under `key`.
    pub fn parse(key: &str, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| CheckpointError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let versioned = value
            .get("version")
            .and_then(Value::as_u64)
            .is_some_and(|v| v >= 1);

        if versioned {
            let envelope: CheckpointEnvelope = serde_json::from_value(value)?;
            if envelope.version > ENVELOPE_VERSION {
                debug!(
                    key,
                    version = envelope.version,
                    "Reading envelope written by a newer version"
                );
            }
            Ok(StoredRecord::Envelope(envelope))
        } else {
            let checkpoint: WorkflowCheckpoint = serde_json::from_value(value)?;
            Ok(StoredRecord::Legacy(Box::new(checkpoint)))
        }
    }

    /// Decode the full checkpoint.
    pub fn into_checkpoint(self, policy: RestorePolicy, key: &str) -> Result<WorkflowCheckpoint> {
        match self {
            StoredRecord::Legacy(checkpoint) => Ok(*checkpoint),
            StoredRecord::Envelope(envelope) => {
                let id = envelope
                    .metadata(META_CHECKPOINT_ID)
                    .map(str::to_string)
                    .unwrap_or_else(|| key_checkpoint_id(key).to_string());
                let payload = envelope.open(policy, &id)?;
                Ok(serde_json::from_slice(&payload)?)
            }
        }
    }
}

/// Composite primary key for a checkpoint.
pub fn primary_key(session_id: &str, checkpoint_id: &str) -> String {
    format!("{session_id}_{checkpoint_id}")
}

/// Checkpoint id part of a primary key.
///
/// Generated ids never contain `_`, so the last separator splits the key.
pub fn key_checkpoint_id(key: &str) -> &str {
    key.rsplit_once('_').map_or(key, |(_, id)| id)
}

/// Session id part of a primary key.
pub fn key_session_id(key: &str) -> &str {
    key.rsplit_once('_').map_or("", |(session, _)| session)
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
