//! Configuration types for the Dealbook engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{constants, DealbookError, Result, Target};

/// Backoff schedule used when the deal sink refuses a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_backoff_ms`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: constants::DEFAULT_SINK_INITIAL_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_SINK_MAX_BACKOFF_MS,
        }
    }
}

/// Engine-wide configuration. The routing table derived from
/// `shard_count` is fixed for the life of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub shard_count: u32,
    /// Pre-registered targets. Empty means any target is accepted.
    pub targets: Vec<Target>,
    pub channel_capacity: usize,
    /// Receipts each shard keeps (and snapshots) for redelivery detection.
    pub idempotency_capacity: usize,
    /// Expiry of claims in the in-memory idempotency store.
    pub claim_ttl_secs: u64,
    /// Commands between periodic snapshots; 0 disables them.
    pub snapshot_every: u64,
    pub snapshots_to_keep: usize,
    pub locator_capacity: usize,
    pub sink_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: constants::DEFAULT_SHARD_COUNT,
            targets: Vec::new(),
            channel_capacity: constants::DEFAULT_CHANNEL_CAPACITY,
            idempotency_capacity: constants::DEFAULT_IDEMPOTENCY_CAPACITY,
            claim_ttl_secs: constants::DEFAULT_CLAIM_TTL_SECS,
            snapshot_every: constants::DEFAULT_SNAPSHOT_EVERY,
            snapshots_to_keep: constants::DEFAULT_SNAPSHOTS_TO_KEEP,
            locator_capacity: constants::DEFAULT_LOCATOR_CAPACITY,
            sink_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    /// Whether commands for `target` are accepted.
    #[must_use]
    pub fn accepts(&self, target: &Target) -> bool {
        self.targets.is_empty() || self.targets.contains(target)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(DealbookError::Configuration(
                "shard_count must be at least 1".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(DealbookError::Configuration(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.idempotency_capacity == 0 {
            return Err(DealbookError::Configuration(
                "idempotency_capacity must be at least 1".into(),
            ));
        }
        if self.locator_capacity == 0 {
            return Err(DealbookError::Configuration(
                "locator_capacity must be at least 1".into(),
            ));
        }
        if self.sink_retry.initial_backoff_ms > self.sink_retry.max_backoff_ms {
            return Err(DealbookError::Configuration(format!(
                "sink_retry.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.sink_retry.initial_backoff_ms, self.sink_retry.max_backoff_ms
            )));
        }
        if let Some(empty) = self.targets.iter().find(|t| t.is_empty()) {
            return Err(DealbookError::Configuration(format!(
                "empty target in registered targets: {empty:?}"
            )));
        }
        Ok(())
    }
}
