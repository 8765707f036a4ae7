//! Storage modules for Silver
//!
//! Binds (database, bucket) pairs to SQLite-backed data files, tracks per-bucket
//! key ranges and wraps transactional reads, writes and deletes.

pub mod engine;
pub mod gateway;
pub mod placement;
pub mod pool;
pub mod shard_index;
pub mod stat;

pub use engine::{Bucket, Cursor, EngineHandle, EngineTxn};
pub use gateway::{DeleteOutcome, GetOutcome, StorageGateway};
pub use placement::Placement;
pub use pool::HandlePool;
pub use shard_index::{
    BucketDescriptor, BucketId, KeyBounds, KeyRange, OrderedCursor, Recovery, ShardIndex,
};
pub use stat::{EntryStats, StatCollector, StatSnapshot};
