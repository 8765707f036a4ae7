//! Silver Core - shard routing and cluster metadata for an embedded key-value store
//!
//! Two pieces live here:
//! - a discovery cache mirroring the coordination store's metadata and node subtrees
//! - a shard index plus storage gateway binding databases to SQLite-backed data files

pub mod coordination;
pub mod discovery;
pub mod error;
pub mod storage;

pub use coordination::{
    CoordinationBuilder, CoordinationStore, EtcdCoordinationStore, KeyValueEntry,
    MemoryCoordinationStore, Snapshot, WatchEvent, WatchEventKind, WatchMessage,
    WatchSubscription,
};
pub use discovery::{DiscoveryCache, DiscoveryOptions, TableKey};
pub use error::{Result, SilverError};
pub use storage::{
    BucketDescriptor, BucketId, DeleteOutcome, EngineHandle, EntryStats, GetOutcome, HandlePool,
    KeyRange, Placement, ShardIndex, StatCollector, StatSnapshot, StorageGateway,
};
