//! System-wide constants for the Dealbook matching engine.

/// Default number of engine shards.
pub const DEFAULT_SHARD_COUNT: u32 = 4;

/// Default capacity of each shard's inbound command channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Receipts remembered per shard for redelivery detection.
pub const DEFAULT_IDEMPOTENCY_CAPACITY: usize = 100_000;

/// Lifetime of a claim in the shared idempotency store, in seconds.
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 300;

/// Commands applied between periodic snapshots.
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 10_000;

/// Snapshot files retained per shard.
pub const DEFAULT_SNAPSHOTS_TO_KEEP: usize = 3;

/// First delay before re-publishing a deal batch, in milliseconds.
pub const DEFAULT_SINK_INITIAL_BACKOFF_MS: u64 = 10;

/// Upper bound on the deal sink retry delay, in milliseconds.
pub const DEFAULT_SINK_MAX_BACKOFF_MS: u64 = 5_000;

/// Entries kept by the router's order locator.
pub const DEFAULT_LOCATOR_CAPACITY: usize = 1_000_000;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "Dealbook";
