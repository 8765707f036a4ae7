use crate::error::{Result, SilverError};
use crate::storage::placement::Placement;
use crate::storage::pool::HandlePool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId {
    pub database: String,
    pub bucket: String,
}

impl BucketId {
    pub fn new(database: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            bucket: bucket.into(),
        }
    }
}

/// Inclusive key range, compared byte-lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl KeyRange {
    pub fn single(key: &[u8]) -> Self {
        Self {
            min_key: key.to_vec(),
            max_key: key.to_vec(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }

    fn extend(&mut self, key: &[u8]) {
        if key < self.min_key.as_slice() {
            self.min_key = key.to_vec();
        }
        if key > self.max_key.as_slice() {
            self.max_key = key.to_vec();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDescriptor {
    pub database: String,
    pub bucket: String,
    pub data_file: PathBuf,
    /// `None` once every key has been deleted; the descriptor itself stays.
    pub range: Option<KeyRange>,
}

/// Ordered access to a bucket's remaining keys, used to re-derive a boundary
/// after the current min or max key is deleted.
pub trait OrderedCursor {
    fn first(&mut self) -> Result<Option<Vec<u8>>>;

    fn last(&mut self) -> Result<Option<Vec<u8>>>;
}

/// First and last key of a bucket, captured inside a transaction so the index
/// can be updated after commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBounds {
    pub first: Option<Vec<u8>>,
    pub last: Option<Vec<u8>>,
}

impl KeyBounds {
    pub fn capture(cursor: &mut impl OrderedCursor) -> Result<Self> {
        Ok(Self {
            first: cursor.first()?,
            last: cursor.last()?,
        })
    }
}

impl OrderedCursor for KeyBounds {
    fn first(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.first.clone())
    }

    fn last(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.last.clone())
    }
}

/// What `ShardIndex::rebuild` found on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub databases: usize,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct IndexState {
    bindings: HashMap<String, PathBuf>,
    buckets: HashMap<BucketId, BucketDescriptor>,
}

/// Maps databases to their sticky data file and (database, bucket) pairs to
/// their live key range.
pub struct ShardIndex {
    placement: Placement,
    state: RwLock<IndexState>,
}

impl ShardIndex {
    pub fn new(placement: Placement) -> Self {
        Self {
            placement,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Data file for `database`, binding one on first use. Once bound, every
    /// bucket and key of the database resolves to the same file.
    pub fn resolve(&self, database: &str, bucket: &str, key: &[u8]) -> Result<PathBuf> {
        validate_database(database)?;
        validate_bucket(bucket)?;

        if let Some(file) = self.read().bindings.get(database) {
            return Ok(file.clone());
        }

        let candidate = self.placement.place(database);
        let mut state = self.write();
        // A concurrent caller may have bound the database meanwhile; its choice wins.
        let file = state
            .bindings
            .entry(database.to_string())
            .or_insert_with(|| {
                tracing::info!(
                    "Bound database {} to {:?} (first key {:?} in bucket {})",
                    database,
                    candidate,
                    String::from_utf8_lossy(key),
                    bucket
                );
                candidate
            })
            .clone();
        Ok(file)
    }

    /// Existing binding for `database`, without creating one.
    pub fn lookup(&self, database: &str) -> Option<PathBuf> {
        self.read().bindings.get(database).cloned()
    }

    /// Extend the (database, bucket) range to cover `key`.
    pub fn record(&self, database: &str, bucket: &str, key: &[u8], data_file: &Path) {
        let mut state = self.write();
        let id = BucketId::new(database, bucket);

        let descriptor = state.buckets.entry(id).or_insert_with(|| {
            tracing::debug!("New bucket descriptor {}/{}", database, bucket);
            BucketDescriptor {
                database: database.to_string(),
                bucket: bucket.to_string(),
                data_file: data_file.to_path_buf(),
                range: None,
            }
        });

        if descriptor.data_file != data_file {
            tracing::warn!(
                "Bucket {}/{} moved from {:?} to {:?}",
                database,
                bucket,
                descriptor.data_file,
                data_file
            );
            descriptor.data_file = data_file.to_path_buf();
        }

        match descriptor.range.as_mut() {
            Some(range) => range.extend(key),
            None => descriptor.range = Some(KeyRange::single(key)),
        }
    }

    /// Shrink the range after `key` was deleted. Only a deleted boundary key
    /// is re-derived through `cursor`; interior deletes leave the range as is.
    ///
    /// Never fails: a missing descriptor is rebuilt from the cursor, and a
    /// cursor error leaves the old (still covering) boundary in place.
    pub fn record_delete(
        &self,
        database: &str,
        bucket: &str,
        key: &[u8],
        cursor: &mut impl OrderedCursor,
    ) {
        let mut state = self.write();
        let id = BucketId::new(database, bucket);

        if !state.buckets.contains_key(&id) {
            tracing::warn!(
                "No descriptor for {}/{} while deleting; rescanning bucket",
                database,
                bucket
            );
            let Some(data_file) = state.bindings.get(database).cloned() else {
                return;
            };
            match rescan(cursor) {
                Ok(range) => {
                    state.buckets.insert(
                        id,
                        BucketDescriptor {
                            database: database.to_string(),
                            bucket: bucket.to_string(),
                            data_file,
                            range,
                        },
                    );
                }
                Err(error) => {
                    tracing::warn!("Rescan of {}/{} failed: {}", database, bucket, error);
                }
            }
            return;
        }

        let Some(descriptor) = state.buckets.get_mut(&id) else {
            return;
        };
        let Some(KeyRange {
            mut min_key,
            mut max_key,
        }) = descriptor.range.clone()
        else {
            return;
        };

        if key == max_key.as_slice() {
            match cursor.last() {
                Ok(Some(last)) => max_key = last,
                Ok(None) => {
                    descriptor.range = None;
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        "Could not re-derive max key of {}/{}: {}",
                        database,
                        bucket,
                        error
                    );
                }
            }
        }

        if key == min_key.as_slice() {
            match cursor.first() {
                Ok(Some(first)) => min_key = first,
                Ok(None) => {
                    descriptor.range = None;
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        "Could not re-derive min key of {}/{}: {}",
                        database,
                        bucket,
                        error
                    );
                }
            }
        }

        descriptor.range = Some(KeyRange { min_key, max_key });
    }

    pub fn descriptor(&self, database: &str, bucket: &str) -> Option<BucketDescriptor> {
        self.read()
            .buckets
            .get(&BucketId::new(database, bucket))
            .cloned()
    }

    pub fn descriptors(&self) -> Vec<BucketDescriptor> {
        let mut descriptors: Vec<BucketDescriptor> =
            self.read().buckets.values().cloned().collect();
        descriptors.sort_by(|a, b| (&a.database, &a.bucket).cmp(&(&b.database, &b.bucket)));
        descriptors
    }

    pub fn bindings(&self) -> HashMap<String, PathBuf> {
        self.read().bindings.clone()
    }

    /// Rebuild bindings and bucket ranges from the data files already present
    /// in the placement directories.
    pub fn rebuild(&self, pool: &HandlePool) -> Result<Recovery> {
        let mut found = Vec::new();
        for directory in self.placement.directories() {
            if !directory.exists() {
                continue;
            }
            for entry in std::fs::read_dir(directory)? {
                let path = entry?.path();
                if !path.is_file() || path.extension().is_none_or(|ext| ext != "db") {
                    continue;
                }
                let Some(database) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                if validate_database(database).is_err() {
                    continue;
                }
                found.push((database.to_string(), path.clone()));
            }
        }
        found.sort();

        let mut recovery = Recovery::default();
        for (database, path) in found {
            if let Some(existing) = self.lookup(&database) {
                tracing::warn!(
                    "Database {} has data files {:?} and {:?}; keeping the first",
                    database,
                    existing,
                    path
                );
                continue;
            }

            let handle = pool.acquire(&path)?;
            let (descriptors, entries, bytes) = handle.view(|txn| {
                let mut descriptors = Vec::new();
                let (mut entries, mut bytes) = (0, 0);
                for name in txn.bucket_names()? {
                    let Some(bucket) = txn.bucket(&name)? else {
                        continue;
                    };
                    let (count, size) = bucket.usage()?;
                    entries += count;
                    bytes += size;
                    descriptors.push(BucketDescriptor {
                        database: database.clone(),
                        bucket: name,
                        data_file: path.clone(),
                        range: rescan(&mut bucket.cursor())?,
                    });
                }
                Ok((descriptors, entries, bytes))
            })?;

            let mut state = self.write();
            state.bindings.insert(database.clone(), path.clone());
            for descriptor in descriptors {
                state.buckets.insert(
                    BucketId::new(&descriptor.database, &descriptor.bucket),
                    descriptor,
                );
            }
            recovery.databases += 1;
            recovery.entries += entries;
            recovery.bytes += bytes;
            tracing::info!(
                "Recovered database {} from {:?} ({} entries)",
                database,
                path,
                entries
            );
        }

        Ok(recovery)
    }
}

fn rescan(cursor: &mut impl OrderedCursor) -> Result<Option<KeyRange>> {
    match (cursor.first()?, cursor.last()?) {
        (Some(min_key), Some(max_key)) => Ok(Some(KeyRange { min_key, max_key })),
        _ => Ok(None),
    }
}

fn validate_database(database: &str) -> Result<()> {
    if database.is_empty()
        || database == "."
        || database == ".."
        || database.contains(['/', '\\'])
    {
        return Err(SilverError::InvalidRequest(format!(
            "invalid database name: {:?}",
            database
        )));
    }
    Ok(())
}

fn validate_bucket(bucket: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(SilverError::InvalidRequest(
            "bucket name cannot be empty".to_string(),
        ));
    }
    Ok(())
}
