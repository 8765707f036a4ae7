use crate::error::{Result, SilverError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Chooses the data directory for a database that has no binding yet.
///
/// An existing `<dir>/<database>.db` always wins, so bindings survive restarts.
/// Otherwise the directory is picked by rendezvous hashing, which is stable for
/// a fixed directory list and moves only the affected databases when the list
/// changes.
#[derive(Debug, Clone)]
pub struct Placement {
    directories: Vec<PathBuf>,
}

impl Placement {
    pub fn new(directories: Vec<PathBuf>) -> Result<Self> {
        if directories.is_empty() {
            return Err(SilverError::Config(
                "at least one storage directory is required".to_string(),
            ));
        }
        Ok(Self { directories })
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn file_name(database: &str) -> String {
        format!("{}.db", database)
    }

    pub fn place(&self, database: &str) -> PathBuf {
        let file_name = Self::file_name(database);

        if let Some(existing) = self
            .directories
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.exists())
        {
            return existing;
        }

        let directory = self
            .directories
            .iter()
            .max_by_key(|dir| rendezvous_score(dir, database))
            .unwrap_or(&self.directories[0]);
        directory.join(file_name)
    }
}

fn rendezvous_score(directory: &Path, database: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(directory.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(database.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
