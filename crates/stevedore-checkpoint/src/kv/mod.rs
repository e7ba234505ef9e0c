//! Embedded transactional key-value storage.
//!
//! The checkpoint store only needs ordered byte keys grouped into named
//! buckets, prefix iteration, and atomic read and write scopes. Anything
//! offering those can back it:
//!
//! - [`SqliteKv`]: durable, one SQLite file, WAL mode
//! - [`MemoryKv`]: process-local, for tests and ephemeral runs

mod memory;
mod sqlite;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

use crate::error::Result;

/// Bucket holding checkpoint envelopes keyed by `{session_id}_{checkpoint_id}`.
pub const CHECKPOINTS_BUCKET: &str = "checkpoints";

/// Bucket mapping checkpoint id to its primary key.
pub const INDEX_BUCKET: &str = "checkpoint_index";

/// A key/value pair returned by a scan.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Read operations available inside a transaction.
pub trait ReadTxn {
    /// Fetch a single value.
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order.
    ///
    /// An empty prefix scans the whole bucket.
    fn scan_prefix(&self, bucket: &str, prefix: &[u8]) -> Result<Vec<Entry>>;
}

/// Write operations available inside a read-write transaction.
pub trait WriteTxn: ReadTxn {
    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<bool>;
}

/// A transactional key-value store.
///
/// `update` commits only if the closure returns `Ok`; any error leaves the
/// store exactly as it was.
pub trait KvStore: Send + Sync {
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTxn) -> Result<T>) -> Result<T>;

    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTxn) -> Result<T>) -> Result<T>;
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// `None` when no such bound exists (empty or all-`0xFF` prefix).
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}
