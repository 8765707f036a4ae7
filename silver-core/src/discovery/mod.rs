//! Discovery cache
//!
//! Mirrors two coordination-store subtrees into local maps:
//! - metadata subtree `<prefix>/<database>/<table>/<shardId>` into shard presence
//! - node subtree `<prefix>/<clusterId>/<nodeId>` into cluster addresses
//!
//! Each subtree is snapshotted once and then followed by a standing watch. A
//! broken watch is re-subscribed with backoff from the last applied revision;
//! readers see `is_stale() == true` until it is re-established.

pub mod path;

use crate::coordination::{
    CoordinationStore, Snapshot, WatchEvent, WatchEventKind, WatchMessage, WatchSubscription,
};
use crate::Result;
use path::{parse_node_path, parse_shard_path};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub database: String,
    pub table: String,
}

impl TableKey {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subtree {
    Metadata,
    Node,
}

type PresenceMap = HashMap<TableKey, BTreeSet<String>>;
type AddressMap = HashMap<String, String>;

#[derive(Default)]
struct DiscoveryState {
    presence: RwLock<PresenceMap>,
    addresses: RwLock<AddressMap>,
    metadata_stale: AtomicBool,
    node_stale: AtomicBool,
}

impl DiscoveryState {
    fn stale_flag(&self, subtree: Subtree) -> &AtomicBool {
        match subtree {
            Subtree::Metadata => &self.metadata_stale,
            Subtree::Node => &self.node_stale,
        }
    }

    fn set_stale(&self, subtree: Subtree, stale: bool) {
        self.stale_flag(subtree).store(stale, Ordering::SeqCst);
    }

    fn apply(&self, subtree: Subtree, prefix: &str, event: &WatchEvent) {
        match subtree {
            Subtree::Metadata => {
                let mut presence = self
                    .presence
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                apply_shard_event(&mut presence, prefix, event);
            }
            Subtree::Node => {
                let mut addresses = self
                    .addresses
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                apply_node_event(&mut addresses, prefix, event);
            }
        }
    }

    /// Swap the subtree's map for one rebuilt from `snapshot`.
    fn replace(&self, subtree: Subtree, prefix: &str, snapshot: &Snapshot) {
        let events = snapshot.entries.iter().map(|entry| WatchEvent {
            kind: WatchEventKind::Put,
            key: entry.key.clone(),
            value: entry.value.clone(),
            revision: snapshot.revision,
        });

        match subtree {
            Subtree::Metadata => {
                let mut rebuilt = PresenceMap::new();
                for event in events {
                    apply_shard_event(&mut rebuilt, prefix, &event);
                }
                *self.presence.write().unwrap_or_else(PoisonError::into_inner) = rebuilt;
            }
            Subtree::Node => {
                let mut rebuilt = AddressMap::new();
                for event in events {
                    apply_node_event(&mut rebuilt, prefix, &event);
                }
                *self
                    .addresses
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = rebuilt;
            }
        }
    }
}

fn apply_shard_event(presence: &mut PresenceMap, prefix: &str, event: &WatchEvent) {
    let Some(shard) = parse_shard_path(prefix, &event.key) else {
        tracing::debug!("Ignoring malformed metadata key {}", event.key);
        return;
    };
    let table = TableKey::new(shard.database, shard.table);

    match event.kind {
        WatchEventKind::Put => {
            presence
                .entry(table)
                .or_default()
                .insert(shard.shard_id.to_string());
        }
        WatchEventKind::Delete => {
            // Only the named shard goes away; the table entry is dropped once empty.
            if let Some(shards) = presence.get_mut(&table) {
                shards.remove(shard.shard_id);
                if shards.is_empty() {
                    presence.remove(&table);
                }
            }
        }
    }
}

fn apply_node_event(addresses: &mut AddressMap, prefix: &str, event: &WatchEvent) {
    let Some(node) = parse_node_path(prefix, &event.key) else {
        tracing::debug!("Ignoring malformed node key {}", event.key);
        return;
    };

    match event.kind {
        WatchEventKind::Put => {
            tracing::debug!(
                "Cluster {} address {} (node {})",
                node.cluster_id,
                event.value,
                node.node_id
            );
            addresses.insert(node.cluster_id.to_string(), event.value.clone());
        }
        WatchEventKind::Delete => {
            addresses.remove(node.cluster_id);
        }
    }
}

pub struct DiscoveryCache {
    state: Arc<DiscoveryState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryCache {
    pub async fn initialize(
        store: Arc<dyn CoordinationStore>,
        metadata_prefix: impl Into<String>,
        node_prefix: impl Into<String>,
    ) -> Result<Self> {
        Self::initialize_with_options(
            store,
            metadata_prefix,
            node_prefix,
            DiscoveryOptions::default(),
        )
        .await
    }

    /// Snapshot both subtrees, then start one watch per subtree. Any failure
    /// before both watches are running is returned and nothing is published.
    pub async fn initialize_with_options(
        store: Arc<dyn CoordinationStore>,
        metadata_prefix: impl Into<String>,
        node_prefix: impl Into<String>,
        options: DiscoveryOptions,
    ) -> Result<Self> {
        let metadata_prefix = metadata_prefix.into();
        let node_prefix = node_prefix.into();

        let metadata_snapshot = store.snapshot(&metadata_prefix).await?;
        let node_snapshot = store.snapshot(&node_prefix).await?;

        let metadata_subscription = store
            .watch(&metadata_prefix, metadata_snapshot.revision + 1)
            .await?;
        let node_subscription = store
            .watch(&node_prefix, node_snapshot.revision + 1)
            .await?;

        let state = Arc::new(DiscoveryState::default());
        state.replace(Subtree::Metadata, &metadata_prefix, &metadata_snapshot);
        state.replace(Subtree::Node, &node_prefix, &node_snapshot);

        tracing::info!(
            "Discovery initialized: {} metadata keys at revision {}, {} node keys at revision {}",
            metadata_snapshot.entries.len(),
            metadata_snapshot.revision,
            node_snapshot.entries.len(),
            node_snapshot.revision
        );

        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            SubtreeWatch {
                store: store.clone(),
                prefix: metadata_prefix,
                subtree: Subtree::Metadata,
                state: state.clone(),
                options,
                next_revision: metadata_snapshot.revision + 1,
                needs_resync: false,
            }
            .spawn(metadata_subscription, shutdown.subscribe()),
            SubtreeWatch {
                store,
                prefix: node_prefix,
                subtree: Subtree::Node,
                state: state.clone(),
                options,
                next_revision: node_snapshot.revision + 1,
                needs_resync: false,
            }
            .spawn(node_subscription, shutdown.subscribe()),
        ];

        Ok(Self {
            state,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Shard ids currently known for `database`/`table`.
    pub fn shards(&self, database: &str, table: &str) -> BTreeSet<String> {
        self.state
            .presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TableKey::new(database, table))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_shard(&self, database: &str, table: &str, shard_id: &str) -> bool {
        self.state
            .presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TableKey::new(database, table))
            .is_some_and(|shards| shards.contains(shard_id))
    }

    pub fn tables(&self) -> Vec<TableKey> {
        let mut tables: Vec<TableKey> = self
            .state
            .presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    pub fn address(&self, cluster_id: &str) -> Option<String> {
        self.state
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster_id)
            .cloned()
    }

    pub fn addresses(&self) -> HashMap<String, String> {
        self.state
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True while either subtree's watch is down and being re-established.
    pub fn is_stale(&self) -> bool {
        self.state.metadata_stale.load(Ordering::SeqCst)
            || self.state.node_stale.load(Ordering::SeqCst)
    }

    /// Stop both watches and wait for them to release their streams.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!("Discovery watch task failed: {}", error);
            }
        }
        tracing::info!("Discovery cache shut down");
    }
}

impl Drop for DiscoveryCache {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum WatchEnd {
    Shutdown,
    Disconnected,
    Compacted,
}

struct SubtreeWatch {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    subtree: Subtree,
    state: Arc<DiscoveryState>,
    options: DiscoveryOptions,
    next_revision: i64,
    needs_resync: bool,
}

impl SubtreeWatch {
    fn spawn(
        self,
        subscription: WatchSubscription,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription, shutdown))
    }

    async fn run(mut self, subscription: WatchSubscription, mut shutdown: watch::Receiver<bool>) {
        let mut subscription = Some(subscription);
        let mut backoff = self.options.initial_backoff;

        loop {
            if *shutdown.borrow() {
                return;
            }

            if let Some(mut active) = subscription.take() {
                self.state.set_stale(self.subtree, false);
                backoff = self.options.initial_backoff;

                match self.follow(&mut active, &mut shutdown).await {
                    WatchEnd::Shutdown => return,
                    WatchEnd::Disconnected => {
                        tracing::warn!(
                            "Watch on {} disconnected at revision {}; reconnecting",
                            self.prefix,
                            self.next_revision
                        );
                    }
                    WatchEnd::Compacted => {
                        tracing::warn!(
                            "Watch on {} fell behind compaction; resyncing from snapshot",
                            self.prefix
                        );
                        self.needs_resync = true;
                    }
                }
                self.state.set_stale(self.subtree, true);
            }

            if !self.needs_resync {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.options.max_backoff);
            }

            subscription = self.reconnect().await;
            if subscription.is_none() && self.needs_resync {
                // Resync failed; wait before the next attempt.
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.options.max_backoff);
            }
        }
    }

    async fn follow(
        &mut self,
        subscription: &mut WatchSubscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WatchEnd {
        loop {
            let message = tokio::select! {
                _ = shutdown.changed() => return WatchEnd::Shutdown,
                message = subscription.next() => message,
            };

            match message {
                Some(Ok(WatchMessage::Events(events))) => {
                    for event in &events {
                        self.next_revision = self.next_revision.max(event.revision + 1);
                        self.state.apply(self.subtree, &self.prefix, event);
                    }
                }
                Some(Ok(WatchMessage::Compacted { compact_revision })) => {
                    tracing::debug!(
                        "Watch on {} compacted at revision {}",
                        self.prefix,
                        compact_revision
                    );
                    return WatchEnd::Compacted;
                }
                Some(Err(error)) => {
                    tracing::warn!("Watch on {} failed: {}", self.prefix, error);
                    return WatchEnd::Disconnected;
                }
                None => return WatchEnd::Disconnected,
            }
        }
    }

    async fn reconnect(&mut self) -> Option<WatchSubscription> {
        if self.needs_resync {
            match self.store.snapshot(&self.prefix).await {
                Ok(snapshot) => {
                    self.state.replace(self.subtree, &self.prefix, &snapshot);
                    self.next_revision = snapshot.revision + 1;
                    self.needs_resync = false;
                    tracing::info!(
                        "Resynced {} from snapshot at revision {}",
                        self.prefix,
                        snapshot.revision
                    );
                }
                Err(error) => {
                    tracing::warn!("Snapshot of {} failed: {}", self.prefix, error);
                    return None;
                }
            }
        }

        match self.store.watch(&self.prefix, self.next_revision).await {
            Ok(subscription) => {
                tracing::info!(
                    "Watch on {} re-established from revision {}",
                    self.prefix,
                    self.next_revision
                );
                Some(subscription)
            }
            Err(error) => {
                tracing::warn!("Re-subscribing to {} failed: {}", self.prefix, error);
                None
            }
        }
    }
}
