//! Coordination store backends
//!
//! The discovery cache only needs two things from the coordination store: a
//! point-in-time prefix read and a prefix watch that can resume from a revision.

pub mod etcd;
pub mod factory;
pub mod memory;

pub use etcd::EtcdCoordinationStore;
pub use factory::CoordinationBuilder;
pub use memory::MemoryCoordinationStore;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueEntry {
    pub key: String,
    pub value: String,
}

/// Result of a prefix read. `revision` is the store revision the read observed;
/// a watch started at `revision + 1` sees every later change exactly once.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub revision: i64,
    pub entries: Vec<KeyValueEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub value: String,
    pub revision: i64,
}

#[derive(Debug, Clone)]
pub enum WatchMessage {
    Events(Vec<WatchEvent>),
    /// The requested start revision is no longer retained; the caller must
    /// take a fresh snapshot.
    Compacted { compact_revision: i64 },
}

/// A live prefix watch. Messages arrive in store order. The subscription ends
/// with `None` (or an error) when the underlying stream breaks, and dropping it
/// releases the stream.
pub struct WatchSubscription {
    receiver: mpsc::UnboundedReceiver<Result<WatchMessage>>,
    pump: Option<JoinHandle<()>>,
}

impl WatchSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Result<WatchMessage>>) -> Self {
        Self {
            receiver,
            pump: None,
        }
    }

    pub fn with_pump(
        receiver: mpsc::UnboundedReceiver<Result<WatchMessage>>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            pump: Some(pump),
        }
    }

    pub async fn next(&mut self) -> Option<Result<WatchMessage>> {
        self.receiver.recv().await
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn snapshot(&self, prefix: &str) -> Result<Snapshot>;

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchSubscription>;
}
