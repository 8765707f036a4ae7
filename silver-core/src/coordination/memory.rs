use super::{
    CoordinationStore, KeyValueEntry, Snapshot, WatchEvent, WatchEventKind, WatchMessage,
    WatchSubscription,
};
use crate::{Result, SilverError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

type WatchSender = mpsc::UnboundedSender<Result<WatchMessage>>;

/// In-process coordination store with etcd-like revisions, prefix watches and
/// compaction. Used for single-node deployments and as a test double.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    revision: i64,
    compacted: i64,
    data: BTreeMap<String, String>,
    history: Vec<WatchEvent>,
    watchers: Vec<(String, WatchSender)>,
    unavailable: bool,
}

impl MemoryInner {
    fn publish(&mut self, event: WatchEvent) {
        self.watchers.retain(|(prefix, sender)| {
            if !event.key.starts_with(prefix.as_str()) {
                return !sender.is_closed();
            }
            sender
                .send(Ok(WatchMessage::Events(vec![event.clone()])))
                .is_ok()
        });
        self.history.push(event);
    }
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or update `key`; returns the new store revision.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> i64 {
        let mut inner = self.lock();
        inner.revision += 1;
        let key = key.into();
        let value = value.into();
        inner.data.insert(key.clone(), value.clone());
        let revision = inner.revision;
        inner.publish(WatchEvent {
            kind: WatchEventKind::Put,
            key,
            value,
            revision,
        });
        revision
    }

    /// Remove `key`. Deleting an absent key does not bump the revision.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if inner.data.remove(key).is_none() {
            return false;
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.publish(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
            value: String::new(),
            revision,
        });
        true
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Discard history up to and including `revision`.
    pub fn compact(&self, revision: i64) {
        let mut inner = self.lock();
        let revision = revision.min(inner.revision);
        inner.history.retain(|event| event.revision > revision);
        inner.compacted = inner.compacted.max(revision);
    }

    /// Close every open watch stream, as a dropped connection would.
    pub fn disconnect_watchers(&self) {
        self.lock().watchers.clear();
    }

    /// While unavailable, snapshots and new watches fail with a connection
    /// error and existing watches are disconnected.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut inner = self.lock();
        inner.unavailable = unavailable;
        if unavailable {
            inner.watchers.clear();
        }
    }

    pub fn active_watchers(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|(_, sender)| !sender.is_closed());
        inner.watchers.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn snapshot(&self, prefix: &str) -> Result<Snapshot> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(SilverError::Connection(
                "memory coordination store is unavailable".to_string(),
            ));
        }

        let entries = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValueEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        Ok(Snapshot {
            revision: inner.revision,
            entries,
        })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchSubscription> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(SilverError::Connection(
                "memory coordination store is unavailable".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        if start_revision > 0 && start_revision <= inner.compacted {
            let _ = sender.send(Ok(WatchMessage::Compacted {
                compact_revision: inner.compacted,
            }));
            return Ok(WatchSubscription::new(receiver));
        }

        let replay: Vec<WatchEvent> = inner
            .history
            .iter()
            .filter(|event| event.revision >= start_revision && event.key.starts_with(prefix))
            .cloned()
            .collect();
        if !replay.is_empty() {
            let _ = sender.send(Ok(WatchMessage::Events(replay)));
        }

        inner.watchers.push((prefix.to_string(), sender));
        Ok(WatchSubscription::new(receiver))
    }
}
