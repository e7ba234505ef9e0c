//! In-memory key-value store.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{Entry, KvStore, ReadTxn, WriteTxn};
use crate::error::Result;

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

/// Process-local store with the same transactional guarantees as
/// [`SqliteKv`](super::SqliteKv).
///
/// Writes are staged in an overlay and applied under the write lock only when
/// the update closure succeeds.
#[derive(Debug, Default)]
pub struct MemoryKv {
    buckets: RwLock<BTreeMap<String, Bucket>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTxn) -> Result<T>) -> Result<T> {
        let buckets = self.buckets.read();
        f(&Snapshot { buckets: &buckets })
    }

    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTxn) -> Result<T>) -> Result<T> {
        let mut buckets = self.buckets.write();
        let mut txn = Staged {
            base: Snapshot { buckets: &buckets },
            pending: BTreeMap::new(),
        };
        let value = f(&mut txn)?;
        let pending = txn.pending;

        for ((bucket, key), change) in pending {
            match change {
                Some(bytes) => {
                    buckets.entry(bucket).or_default().insert(key, bytes);
                }
                None => {
                    if let Some(entries) = buckets.get_mut(&bucket) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(value)
    }
}

struct Snapshot<'a> {
    buckets: &'a BTreeMap<String, Bucket>,
}

impl ReadTxn for Snapshot<'_> {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .get(bucket)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn scan_prefix(&self, bucket: &str, prefix: &[u8]) -> Result<Vec<Entry>> {
        let Some(entries) = self.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Pending change per `(bucket, key)`: `Some` to write, `None` to delete.
struct Staged<'a> {
    base: Snapshot<'a>,
    pending: BTreeMap<(String, Vec<u8>), Option<Vec<u8>>>,
}

impl ReadTxn for Staged<'_> {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(&(bucket.to_string(), key.to_vec())) {
            Some(change) => Ok(change.clone()),
            None => self.base.get(bucket, key),
        }
    }

    fn scan_prefix(&self, bucket: &str, prefix: &[u8]) -> Result<Vec<Entry>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.base.scan_prefix(bucket, prefix)?.into_iter().collect();

        for ((b, key), change) in &self.pending {
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            match change {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl WriteTxn for Staged<'_> {
    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.pending
            .insert((bucket.to_string(), key.to_vec()), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<bool> {
        let existed = self.get(bucket, key)?.is_some();
        self.pending.insert((bucket.to_string(), key.to_vec()), None);
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::tests::exercise_backend;

    #[test]
    fn test_memory_backend() {
        exercise_backend(&MemoryKv::new());
    }
}
