use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    /// Entries currently stored.
    pub count: u64,
    /// Key plus value bytes currently stored.
    pub bytes: u64,
    /// Puts since the gateway opened.
    pub added: u64,
    /// Overwritten or deleted entries since the gateway opened.
    pub removed: u64,
}

/// Receives size/count deltas from the storage gateway after each committed
/// write or delete.
pub trait StatCollector: Send + Sync {
    /// Entries already on disk when the gateway opened.
    fn seed(&self, count: u64, bytes: u64);

    fn add(&self, key: &[u8], value: &[u8]);

    fn remove(&self, key: &[u8], value: &[u8]);

    fn snapshot(&self) -> StatSnapshot;
}

#[derive(Debug, Default)]
pub struct EntryStats {
    totals: Mutex<Totals>,
}

#[derive(Debug, Default)]
struct Totals {
    seeded_count: u64,
    seeded_bytes: u64,
    added: u64,
    removed: u64,
    bytes_added: u64,
    bytes_removed: u64,
}

impl EntryStats {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

impl StatCollector for EntryStats {
    fn seed(&self, count: u64, bytes: u64) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.seeded_count += count;
        totals.seeded_bytes += bytes;
    }

    fn add(&self, key: &[u8], value: &[u8]) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.added += 1;
        totals.bytes_added += entry_size(key, value);
    }

    fn remove(&self, key: &[u8], value: &[u8]) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.removed += 1;
        totals.bytes_removed += entry_size(key, value);
    }

    fn snapshot(&self) -> StatSnapshot {
        let totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        StatSnapshot {
            count: (totals.seeded_count + totals.added).saturating_sub(totals.removed),
            bytes: (totals.seeded_bytes + totals.bytes_added).saturating_sub(totals.bytes_removed),
            added: totals.added,
            removed: totals.removed,
        }
    }
}
