use crate::error::{Result, SilverError};
use crate::storage::placement::Placement;
use crate::storage::pool::HandlePool;
use crate::storage::shard_index::{KeyBounds, ShardIndex};
use crate::storage::stat::{EntryStats, StatCollector, StatSnapshot};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Found(Bytes),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Carries the value that was removed.
    Deleted(Bytes),
    NotFound,
}

/// Transactional put/get/delete over sticky-placed data files.
pub struct StorageGateway {
    index: ShardIndex,
    pool: HandlePool,
    stats: Arc<dyn StatCollector>,
}

impl StorageGateway {
    pub fn open(directories: Vec<PathBuf>) -> Result<Self> {
        Self::open_with_stats(directories, Arc::new(EntryStats::new()))
    }

    /// Create the storage directories if needed and recover bindings and
    /// bucket ranges from any data files already in them.
    pub fn open_with_stats(
        directories: Vec<PathBuf>,
        stats: Arc<dyn StatCollector>,
    ) -> Result<Self> {
        for directory in &directories {
            std::fs::create_dir_all(directory)?;
        }

        let index = ShardIndex::new(Placement::new(directories)?);
        let pool = HandlePool::new();
        let recovered = index.rebuild(&pool)?;
        stats.seed(recovered.entries, recovered.bytes);
        tracing::info!(
            "Storage gateway opened over {} directories; recovered {} databases with {} entries",
            index.placement().directories().len(),
            recovered.databases,
            recovered.entries
        );

        Ok(Self { index, pool, stats })
    }

    pub fn put(&self, database: &str, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let data_file = self.index.resolve(database, bucket, key)?;
        let handle = self.pool.acquire(&data_file)?;

        // Stats and range follow the commit while the file is still held, so a
        // concurrent delete of the same key cannot reorder around them.
        handle.update_then(
            |txn| {
                let entries = txn.create_bucket_if_not_exists(bucket)?;
                let previous = entries.get(key)?;
                entries.put(key, value)?;
                Ok(previous)
            },
            |previous| {
                if let Some(previous) = previous {
                    self.stats.remove(key, &previous);
                }
                self.stats.add(key, value);
                self.index.record(database, bucket, key, &data_file);
            },
        )?;

        tracing::debug!(
            "put {}/{} key={:?} ({} bytes) -> {:?}",
            database,
            bucket,
            String::from_utf8_lossy(key),
            value.len(),
            data_file
        );
        Ok(())
    }

    pub fn get(&self, database: &str, bucket: &str, key: &[u8]) -> Result<GetOutcome> {
        let Some(data_file) = self.index.lookup(database) else {
            return Ok(GetOutcome::NotFound);
        };
        let handle = self.pool.acquire(&data_file)?;

        let value = handle.view(|txn| match txn.bucket(bucket)? {
            Some(entries) => entries.get(key),
            None => Ok(None),
        })?;

        Ok(match value {
            Some(value) => GetOutcome::Found(Bytes::from(value)),
            None => GetOutcome::NotFound,
        })
    }

    pub fn delete(&self, database: &str, bucket: &str, key: &[u8]) -> Result<DeleteOutcome> {
        let Some(data_file) = self.index.lookup(database) else {
            return Ok(DeleteOutcome::NotFound);
        };
        let handle = self.pool.acquire(&data_file)?;

        let removed = handle.update_then(
            |txn| {
                let Some(entries) = txn.bucket(bucket)? else {
                    return Ok(None);
                };
                let Some(previous) = entries.get(key)? else {
                    return Ok(None);
                };
                entries.delete(key)?;
                let bounds = KeyBounds::capture(&mut entries.cursor())?;
                Ok(Some((previous, bounds)))
            },
            |removed| {
                let (previous, mut bounds) = removed?;
                self.stats.remove(key, &previous);
                self.index.record_delete(database, bucket, key, &mut bounds);
                Some(previous)
            },
        )?;

        let Some(previous) = removed else {
            return Ok(DeleteOutcome::NotFound);
        };

        tracing::debug!(
            "delete {}/{} key={:?} from {:?}",
            database,
            bucket,
            String::from_utf8_lossy(key),
            data_file
        );
        Ok(DeleteOutcome::Deleted(Bytes::from(previous)))
    }

    pub fn stats(&self) -> StatSnapshot {
        self.stats.snapshot()
    }

    pub fn index(&self) -> &ShardIndex {
        &self.index
    }

    pub fn pool(&self) -> &HandlePool {
        &self.pool
    }

    /// Release every engine handle. Later operations reopen files on demand.
    pub fn close(&self) {
        self.pool.close_all();
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(SilverError::InvalidRequest("key cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Mutex, mpsc};
    use std::thread;
    use std::time::Duration;

    /// Parks inside the first `remove` so a competing write can queue up
    /// behind the operation that triggered it.
    struct ParkedRemove {
        inner: EntryStats,
        entered: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl StatCollector for ParkedRemove {
        fn seed(&self, count: u64, bytes: u64) {
            self.inner.seed(count, bytes);
        }

        fn add(&self, key: &[u8], value: &[u8]) {
            self.inner.add(key, value);
        }

        fn remove(&self, key: &[u8], value: &[u8]) {
            if let Some(entered) = self.entered.lock().unwrap().take() {
                entered.send(()).unwrap();
                thread::sleep(Duration::from_millis(300));
            }
            self.inner.remove(key, value);
        }

        fn snapshot(&self) -> StatSnapshot {
            self.inner.snapshot()
        }
    }

    fn open_two_dirs() -> (tempfile::TempDir, Vec<PathBuf>, StorageGateway) {
        let root = tempfile::tempdir().unwrap();
        let dirs = vec![root.path().join("d0"), root.path().join("d1")];
        let gateway = StorageGateway::open(dirs.clone()).unwrap();
        (root, dirs, gateway)
    }

    fn found(value: &str) -> GetOutcome {
        GetOutcome::Found(Bytes::from(value.to_string()))
    }

    #[test]
    fn test_sales_scenario() {
        let (_root, dirs, gateway) = open_two_dirs();

        gateway.put("sales", "orders", b"100", b"A").unwrap();
        let bound = gateway.index().lookup("sales").unwrap();
        assert!(dirs.iter().any(|dir| bound == dir.join("sales.db")));
        assert!(bound.exists());

        gateway.put("sales", "invoices", b"050", b"B").unwrap();
        assert_eq!(
            gateway.index().resolve("sales", "invoices", b"050").unwrap(),
            bound
        );
        assert_eq!(
            gateway.index().descriptor("sales", "invoices").unwrap().data_file,
            bound
        );

        assert_eq!(gateway.get("sales", "orders", b"100").unwrap(), found("A"));

        assert_eq!(
            gateway.delete("sales", "orders", b"100").unwrap(),
            DeleteOutcome::Deleted(Bytes::from_static(b"A"))
        );
        assert_eq!(
            gateway.get("sales", "orders", b"100").unwrap(),
            GetOutcome::NotFound
        );

        let orders = gateway.index().descriptor("sales", "orders").unwrap();
        assert_eq!(orders.range, None);
        let invoices = gateway.index().descriptor("sales", "invoices").unwrap();
        assert!(invoices.range.unwrap().contains(b"050"));
    }

    #[test]
    fn test_missing_values_are_not_errors() {
        let (root, _dirs, gateway) = open_two_dirs();

        assert_eq!(
            gateway.get("nobody", "orders", b"1").unwrap(),
            GetOutcome::NotFound
        );
        assert_eq!(
            gateway.delete("nobody", "orders", b"1").unwrap(),
            DeleteOutcome::NotFound
        );
        // Reads of unknown databases neither bind nor create files.
        assert!(gateway.index().bindings().is_empty());
        assert!(!root.path().join("d0/nobody.db").exists());
        assert!(!root.path().join("d1/nobody.db").exists());

        gateway.put("sales", "orders", b"100", b"A").unwrap();
        assert_eq!(
            gateway.get("sales", "invoices", b"100").unwrap(),
            GetOutcome::NotFound
        );
        assert_eq!(
            gateway.delete("sales", "orders", b"999").unwrap(),
            DeleteOutcome::NotFound
        );
        assert_eq!(gateway.stats().count, 1);
    }

    #[test]
    fn test_range_tracks_writes_and_boundary_deletes() {
        let (_root, _dirs, gateway) = open_two_dirs();
        let keys: [&[u8]; 5] = [b"300", b"100", b"500", b"200", b"400"];
        for key in keys {
            gateway.put("sales", "orders", key, b"v").unwrap();
            let range = gateway
                .index()
                .descriptor("sales", "orders")
                .unwrap()
                .range
                .unwrap();
            assert!(range.contains(key));
        }

        let range = |gateway: &StorageGateway| {
            gateway
                .index()
                .descriptor("sales", "orders")
                .unwrap()
                .range
                .map(|range| (range.min_key, range.max_key))
        };
        assert_eq!(range(&gateway), Some((b"100".to_vec(), b"500".to_vec())));

        gateway.delete("sales", "orders", b"500").unwrap();
        assert_eq!(range(&gateway), Some((b"100".to_vec(), b"400".to_vec())));

        gateway.delete("sales", "orders", b"100").unwrap();
        assert_eq!(range(&gateway), Some((b"200".to_vec(), b"400".to_vec())));

        gateway.delete("sales", "orders", b"300").unwrap();
        assert_eq!(range(&gateway), Some((b"200".to_vec(), b"400".to_vec())));

        gateway.delete("sales", "orders", b"200").unwrap();
        gateway.delete("sales", "orders", b"400").unwrap();
        assert_eq!(range(&gateway), None);
    }

    #[test]
    fn test_overwrite_accounts_for_previous_value() {
        let (_root, _dirs, gateway) = open_two_dirs();

        gateway.put("sales", "orders", b"100", b"A").unwrap();
        gateway.put("sales", "orders", b"100", b"BBBB").unwrap();
        assert_eq!(gateway.get("sales", "orders", b"100").unwrap(), found("BBBB"));

        let stats = gateway.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes, 7);

        gateway.delete("sales", "orders", b"100").unwrap();
        let stats = gateway.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.removed, 2);
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let (_root, _dirs, gateway) = open_two_dirs();

        assert!(matches!(
            gateway.put("sales", "orders", b"", b"A"),
            Err(SilverError::InvalidRequest(_))
        ));
        assert!(matches!(
            gateway.put("../etc", "orders", b"1", b"A"),
            Err(SilverError::InvalidRequest(_))
        ));
        assert!(matches!(
            gateway.put("sales", "", b"1", b"A"),
            Err(SilverError::InvalidRequest(_))
        ));
        assert_eq!(gateway.stats(), StatSnapshot::default());
    }

    #[test]
    fn test_reopen_recovers_bindings_and_ranges() {
        let root = tempfile::tempdir().unwrap();
        let dirs = vec![root.path().join("d0"), root.path().join("d1")];

        let bound = {
            let gateway = StorageGateway::open(dirs.clone()).unwrap();
            gateway.put("sales", "orders", b"100", b"A").unwrap();
            gateway.put("sales", "orders", b"300", b"C").unwrap();
            gateway.put("sales", "invoices", b"050", b"B").unwrap();
            gateway.put("sales", "orders", b"200", b"D").unwrap();
            gateway.delete("sales", "orders", b"200").unwrap();
            gateway.close();
            gateway.index().lookup("sales").unwrap()
        };

        let reopened = StorageGateway::open(dirs).unwrap();
        assert_eq!(reopened.index().lookup("sales"), Some(bound.clone()));
        assert_eq!(
            reopened.index().resolve("sales", "archive", b"1").unwrap(),
            bound
        );

        let orders = reopened.index().descriptor("sales", "orders").unwrap();
        let range = orders.range.unwrap();
        assert_eq!(range.min_key, b"100".to_vec());
        assert_eq!(range.max_key, b"300".to_vec());
        assert!(reopened.index().descriptor("sales", "invoices").is_some());
        assert_eq!(reopened.get("sales", "orders", b"300").unwrap(), found("C"));

        // 100/A, 300/C and 050/B survive the restart.
        assert_eq!(
            reopened.stats(),
            StatSnapshot {
                count: 3,
                bytes: 12,
                added: 0,
                removed: 0,
            }
        );
        reopened.delete("sales", "orders", b"100").unwrap();
        reopened.put("sales", "orders", b"400", b"EE").unwrap();
        let stats = reopened.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.bytes, 13);
    }

    #[test]
    fn test_put_racing_boundary_delete_keeps_key_in_range() {
        let root = tempfile::tempdir().unwrap();
        let (entered, parked) = mpsc::channel();
        let stats = Arc::new(ParkedRemove {
            inner: EntryStats::new(),
            entered: Mutex::new(Some(entered)),
        });
        let gateway = Arc::new(
            StorageGateway::open_with_stats(vec![root.path().join("d0")], stats).unwrap(),
        );

        for key in ["100", "400", "500"] {
            gateway.put("sales", "orders", key.as_bytes(), b"v").unwrap();
        }

        let deleter = {
            let gateway = gateway.clone();
            thread::spawn(move || gateway.delete("sales", "orders", b"500").unwrap())
        };

        // The delete has committed and is parked before touching the index.
        parked.recv().unwrap();
        gateway.put("sales", "orders", b"500", b"again").unwrap();
        assert_eq!(
            deleter.join().unwrap(),
            DeleteOutcome::Deleted(Bytes::from_static(b"v"))
        );

        assert_eq!(gateway.get("sales", "orders", b"500").unwrap(), found("again"));
        let range = gateway
            .index()
            .descriptor("sales", "orders")
            .unwrap()
            .range
            .unwrap();
        assert!(range.contains(b"500"));
        assert_eq!(range.min_key, b"100".to_vec());
        assert_eq!(range.max_key, b"500".to_vec());
        assert_eq!(gateway.stats().count, 3);
    }

    #[test]
    fn test_concurrent_puts_and_deletes_keep_ranges_covering() {
        let root = tempfile::tempdir().unwrap();
        let gateway = Arc::new(StorageGateway::open(vec![root.path().join("d0")]).unwrap());

        const THREADS: usize = 4;
        const ROUNDS: usize = 50;

        let workers: Vec<_> = (0..THREADS)
            .map(|thread_no| {
                let gateway = gateway.clone();
                thread::spawn(move || {
                    for i in 0..ROUNDS {
                        let key = format!("{:03}", (thread_no * 7 + i) % 20);
                        if (thread_no + i) % 3 == 0 {
                            gateway.delete("sales", "orders", key.as_bytes()).unwrap();
                        } else {
                            gateway.put("sales", "orders", key.as_bytes(), b"v").unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let handle = gateway.pool().acquire(&gateway.index().lookup("sales").unwrap()).unwrap();
        let (first, last, count) = handle
            .view(|txn| {
                let bucket = txn.bucket("orders")?.unwrap();
                let cursor = bucket.cursor();
                Ok((cursor.first()?, cursor.last()?, bucket.usage()?.0))
            })
            .unwrap();

        let range = gateway.index().descriptor("sales", "orders").unwrap().range;
        match (first, last) {
            (Some(first), Some(last)) => {
                let range = range.unwrap();
                assert!(range.contains(&first));
                assert!(range.contains(&last));
            }
            _ => assert!(range.is_none()),
        }
        assert_eq!(gateway.stats().count, count);
    }

    #[test]
    fn test_concurrent_puts_bind_each_database_once() {
        let root = tempfile::tempdir().unwrap();
        let dirs: Vec<PathBuf> = (0..3).map(|i| root.path().join(format!("d{}", i))).collect();
        let gateway = Arc::new(StorageGateway::open(dirs).unwrap());

        const DATABASES: usize = 5;
        const THREADS: usize = 8;
        const PUTS_PER_THREAD: usize = 25;

        let workers: Vec<_> = (0..THREADS)
            .map(|thread_no| {
                let gateway = gateway.clone();
                thread::spawn(move || {
                    for i in 0..PUTS_PER_THREAD {
                        let database = format!("db{}", (thread_no + i) % DATABASES);
                        let bucket = format!("bucket{}", i % 2);
                        let key = format!("{:02}-{:03}", thread_no, i);
                        gateway
                            .put(&database, &bucket, key.as_bytes(), b"value")
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let bindings = gateway.index().bindings();
        assert_eq!(bindings.len(), DATABASES);
        let files: HashSet<PathBuf> = bindings.values().cloned().collect();
        assert_eq!(files.len(), DATABASES);

        let descriptors = gateway.index().descriptors();
        assert_eq!(descriptors.len(), DATABASES * 2);
        for descriptor in &descriptors {
            assert_eq!(descriptor.data_file, bindings[&descriptor.database]);
        }

        assert_eq!(gateway.stats().count, (THREADS * PUTS_PER_THREAD) as u64);
        assert_eq!(gateway.pool().open_handles(), DATABASES);
    }
}
