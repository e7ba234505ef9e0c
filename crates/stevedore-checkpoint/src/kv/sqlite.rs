//! SQLite-backed key-value store.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use super::{Entry, KvStore, ReadTxn, WriteTxn, prefix_upper_bound};
use crate::error::{CheckpointError, Result};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Key-value store in a single SQLite table.
///
/// Uses WAL mode so readers do not block behind the single writer.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKv").finish_non_exhaustive()
    }
}

impl SqliteKv {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|_| {
                CheckpointError::Storage(rusqlite::Error::InvalidPath(path.to_path_buf()))
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;

        let kv = Self {
            conn: Mutex::new(conn),
        };
        kv.initialize()?;

        info!(path = %path.display(), "Checkpoint database opened");
        Ok(kv)
    }

    /// Create an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let kv = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        kv.initialize()?;
        debug!("In-memory checkpoint database created");
        Ok(kv)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current_version >= SCHEMA_VERSION {
            debug!(version = current_version, "Checkpoint schema up to date");
            return Ok(());
        }

        info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrating checkpoint schema"
        );

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            ) WITHOUT ROWID;
            "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(())
    }
}

impl KvStore for SqliteKv {
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTxn) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let txn = SqliteTxn { tx };
        // Dropping the transaction rolls back; reads have nothing to commit.
        f(&txn)
    }

    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTxn) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut txn = SqliteTxn { tx };
        let value = f(&mut txn)?;
        txn.tx.commit()?;
        Ok(value)
    }
}

struct SqliteTxn<'conn> {
    tx: Transaction<'conn>,
}

impl ReadTxn for SqliteTxn<'_> {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .tx
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn scan_prefix(&self, bucket: &str, prefix: &[u8]) -> Result<Vec<Entry>> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Entry> {
            Ok((row.get(0)?, row.get(1)?))
        };

        let entries = match prefix_upper_bound(prefix) {
            Some(upper) => {
                let mut stmt = self.tx.prepare_cached(
                    "SELECT key, value FROM kv
                     WHERE bucket = ?1 AND key >= ?2 AND key < ?3
                     ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(params![bucket, prefix, upper], map_row)?
                    .collect::<rusqlite::Result<Vec<Entry>>>()?;
                rows
            }
            None => {
                let mut stmt = self.tx.prepare_cached(
                    "SELECT key, value FROM kv
                     WHERE bucket = ?1 AND key >= ?2
                     ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(params![bucket, prefix], map_row)?
                    .collect::<rusqlite::Result<Vec<Entry>>>()?;
                rows
            }
        };
        Ok(entries)
    }
}

impl WriteTxn for SqliteTxn<'_> {
    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.execute(
            "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket, key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<bool> {
        let removed = self.tx.execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::tests::exercise_backend;

    #[test]
    fn test_sqlite_backend() {
        let kv = SqliteKv::open_in_memory().unwrap();
        exercise_backend(&kv);
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");

        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.update(|txn| txn.put("checkpoints", b"k", b"v")).unwrap();
        }

        let kv = SqliteKv::open(&path).unwrap();
        let value = kv.view(|txn| txn.get("checkpoints", b"k")).unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
    }
}
