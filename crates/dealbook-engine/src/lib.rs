//! # dealbook-engine
//!
//! **Execution plane**: the sharded engine that owns every order book.
//!
//! ## Architecture
//!
//! Targets are hashed onto a fixed number of shards. Each shard is a single
//! tokio task that owns the books of its targets and applies commands one
//! at a time:
//! 1. Detects redelivery (receipt ledger, then the shared idempotency store)
//! 2. Validates the command and applies it to the target's book
//! 3. Delivers the resulting deals to the sink, retrying until accepted
//! 4. Records and returns the receipt
//! 5. Snapshots periodically and at shutdown
//!
//! On startup every shard restores its latest snapshot before the engine
//! accepts commands.

pub mod engine;
pub mod idempotency;
pub mod router;
pub mod runtime;
pub mod shard;
pub mod sink;
pub mod snapshot;

pub use engine::{Engine, PendingReceipt};
pub use idempotency::{Claim, IdempotencyStore, MemoryIdempotencyStore, ReceiptLedger};
pub use router::{OrderLocator, Router, shard_for, shard_for_unknown};
pub use runtime::{ShardHandle, ShardMessage};
pub use shard::{Shard, ShardState};
pub use sink::{ChannelSink, DealSink, SinkError, publish_with_retry};
pub use snapshot::{
    EpochStart, FileSnapshotStore, MemorySnapshotStore, ShardSnapshot, SnapshotBody,
    SnapshotStore, TargetSnapshot,
};
