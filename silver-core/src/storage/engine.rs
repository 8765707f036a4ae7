use crate::error::{Result, SilverError};
use crate::storage::shard_index::OrderedCursor;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One open data file. A data file holds any number of named buckets, each an
/// ordered key/value namespace. Keys are BLOBs, so SQLite orders them by memcmp,
/// i.e. byte-lexicographically.
pub struct EngineHandle {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl EngineHandle {
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY
            ) WITHOUT ROWID;
            CREATE TABLE IF NOT EXISTS entries (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            ) WITHOUT ROWID;",
        )?;

        tracing::debug!("Opened data file {:?}", path);
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` in a read-write transaction. The transaction commits only when
    /// `f` returns `Ok`; any error rolls back every write made inside it.
    pub fn update<T>(&self, f: impl FnOnce(&EngineTxn<'_>) -> Result<T>) -> Result<T> {
        self.update_then(f, |value| value)
    }

    /// Like `update`, then run `after` on the committed result before the
    /// handle is released. Writers on this file observe `after` as part of
    /// the same critical section.
    pub fn update_then<T, R>(
        &self,
        f: impl FnOnce(&EngineTxn<'_>) -> Result<T>,
        after: impl FnOnce(T) -> R,
    ) -> Result<R> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&EngineTxn {
            conn: &tx,
            writable: true,
        })?;
        tx.commit()?;
        Ok(after(value))
    }

    /// Run `f` in a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&EngineTxn<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        f(&EngineTxn {
            conn: &tx,
            writable: false,
        })
    }
}

pub struct EngineTxn<'t> {
    conn: &'t Connection,
    writable: bool,
}

impl<'t> EngineTxn<'t> {
    pub fn create_bucket_if_not_exists(&self, name: &str) -> Result<Bucket<'t>> {
        if !self.writable {
            return Err(SilverError::ReadOnlyTransaction(name.to_string()));
        }

        self.conn
            .execute("INSERT OR IGNORE INTO buckets (name) VALUES (?1)", [name])?;

        Ok(Bucket {
            conn: self.conn,
            name: name.to_string(),
            writable: true,
        })
    }

    pub fn bucket(&self, name: &str) -> Result<Option<Bucket<'t>>> {
        let exists = self
            .conn
            .query_row("SELECT 1 FROM buckets WHERE name = ?1", [name], |_| Ok(()))
            .optional()?;

        Ok(exists.map(|_| Bucket {
            conn: self.conn,
            name: name.to_string(),
            writable: self.writable,
        }))
    }

    pub fn bucket_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM buckets ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }
}

pub struct Bucket<'t> {
    conn: &'t Connection,
    name: String,
    writable: bool,
}

impl<'t> Bucket<'t> {
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SilverError::ReadOnlyTransaction(self.name.clone()));
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO entries (bucket, key, value) VALUES (?1, ?2, ?3)",
            params![self.name, key, value],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM entries WHERE bucket = ?1 AND key = ?2",
                params![self.name, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Returns whether the key existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        if !self.writable {
            return Err(SilverError::ReadOnlyTransaction(self.name.clone()));
        }

        let affected = self.conn.execute(
            "DELETE FROM entries WHERE bucket = ?1 AND key = ?2",
            params![self.name, key],
        )?;
        Ok(affected > 0)
    }

    /// Number of entries and their key plus value bytes.
    pub fn usage(&self) -> Result<(u64, u64)> {
        let (count, bytes): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0)
             FROM entries WHERE bucket = ?1",
            [&self.name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count as u64, bytes as u64))
    }

    pub fn cursor(&self) -> Cursor<'t> {
        Cursor {
            conn: self.conn,
            bucket: self.name.clone(),
        }
    }
}

/// Ordered view over one bucket's keys.
pub struct Cursor<'t> {
    conn: &'t Connection,
    bucket: String,
}

impl Cursor<'_> {
    fn edge(&self, sql: &str) -> Result<Option<Vec<u8>>> {
        let key = self
            .conn
            .query_row(sql, [&self.bucket], |row| row.get(0))
            .optional()?;
        Ok(key)
    }

    pub fn first(&self) -> Result<Option<Vec<u8>>> {
        self.edge("SELECT key FROM entries WHERE bucket = ?1 ORDER BY key ASC LIMIT 1")
    }

    pub fn last(&self) -> Result<Option<Vec<u8>>> {
        self.edge("SELECT key FROM entries WHERE bucket = ?1 ORDER BY key DESC LIMIT 1")
    }
}

impl OrderedCursor for Cursor<'_> {
    fn first(&mut self) -> Result<Option<Vec<u8>>> {
        Cursor::first(self)
    }

    fn last(&mut self) -> Result<Option<Vec<u8>>> {
        Cursor::last(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_roundtrip_and_cursor() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handle = EngineHandle::open_or_create(temp_dir.path().join("nested/sales.db")).unwrap();

        handle
            .update(|txn| {
                let bucket = txn.create_bucket_if_not_exists("orders")?;
                bucket.put(b"100", b"A")?;
                bucket.put(b"050", b"B")?;
                bucket.put(b"2", b"C")?;
                Ok(())
            })
            .unwrap();

        handle
            .view(|txn| {
                let bucket = txn.bucket("orders")?.expect("bucket exists");
                assert_eq!(bucket.get(b"100")?, Some(b"A".to_vec()));
                assert_eq!(bucket.get(b"missing")?, None);
                // "100"+"A", "050"+"B", "2"+"C"
                assert_eq!(bucket.usage()?, (3, 10));
                // Byte order, not numeric order.
                assert_eq!(bucket.cursor().first()?, Some(b"050".to_vec()));
                assert_eq!(bucket.cursor().last()?, Some(b"2".to_vec()));
                assert!(txn.bucket("invoices")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handle = EngineHandle::open_or_create(temp_dir.path().join("sales.db")).unwrap();

        let result: Result<()> = handle.update(|txn| {
            let bucket = txn.create_bucket_if_not_exists("orders")?;
            bucket.put(b"100", b"A")?;
            Err(SilverError::Internal("abort".to_string()))
        });
        assert!(result.is_err());

        let names = handle.view(|txn| txn.bucket_names()).unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn test_update_then_runs_after_commit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handle = EngineHandle::open_or_create(temp_dir.path().join("sales.db")).unwrap();

        let seen = handle
            .update_then(
                |txn| {
                    txn.create_bucket_if_not_exists("orders")?.put(b"100", b"A")?;
                    Ok(1u32)
                },
                |written| written + 1,
            )
            .unwrap();
        assert_eq!(seen, 2);

        let mut ran = false;
        let result: Result<()> = handle.update_then(
            |_| Err(SilverError::Internal("abort".to_string())),
            |_: ()| ran = true,
        );
        assert!(result.is_err());
        assert!(!ran);
    }

    #[test]
    fn test_view_rejects_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handle = EngineHandle::open_or_create(temp_dir.path().join("sales.db")).unwrap();

        let result = handle.view(|txn| txn.create_bucket_if_not_exists("orders").map(|_| ()));
        assert!(matches!(result, Err(SilverError::ReadOnlyTransaction(_))));
    }

    #[test]
    fn test_delete_and_empty_bucket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handle = EngineHandle::open_or_create(temp_dir.path().join("sales.db")).unwrap();

        let existed = handle
            .update(|txn| {
                let bucket = txn.create_bucket_if_not_exists("orders")?;
                bucket.put(b"k", b"v")?;
                let first = bucket.delete(b"k")?;
                let second = bucket.delete(b"k")?;
                assert_eq!(bucket.usage()?, (0, 0));
                assert_eq!(bucket.cursor().first()?, None);
                Ok((first, second))
            })
            .unwrap();
        assert_eq!(existed, (true, false));

        // The bucket itself outlives its last key.
        let names = handle.view(|txn| txn.bucket_names()).unwrap();
        assert_eq!(names, vec!["orders".to_string()]);
    }
}
