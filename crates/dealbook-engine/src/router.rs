//! Target-to-shard routing.
//!
//! Every target is owned by exactly one shard, chosen by hashing the
//! symbol. The table is fixed when the engine starts: changing
//! `shard_count` moves targets between shards and requires a fresh
//! snapshot directory.
//!
//! Cancels name only the order they refer to, so the router also keeps an
//! [`OrderLocator`] that remembers which shard each order was sent to.

use std::collections::{HashMap, VecDeque};

use dealbook_types::{Command, RequestId, ShardId, Target};
use sha2::{Digest, Sha256};

/// Deterministic owner of `target` among `shard_count` shards.
///
/// # Panics
/// Panics if `shard_count` is zero.
#[must_use]
pub fn shard_for(target: &Target, shard_count: u32) -> ShardId {
    assert!(shard_count > 0, "shard_count must be > 0");
    let digest = Sha256::digest(target.as_str().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let index = u64::from_be_bytes(head) % u64::from(shard_count);
    // index < shard_count, which fits in u32.
    ShardId(u32::try_from(index).unwrap_or(0))
}

/// Fallback shard for a command whose order is unknown to the locator.
///
/// Hashing the missing order id keeps redeliveries of the same command on
/// the same shard, so its `NotFound` receipt is recorded once.
#[must_use]
pub fn shard_for_unknown(order_id: &RequestId, shard_count: u32) -> ShardId {
    shard_for(&Target::new(order_id.as_str()), shard_count)
}

// =====================================================================
// OrderLocator
// =====================================================================

/// Bounded map of order id to owning shard, evicting the oldest entry.
#[derive(Debug)]
pub struct OrderLocator {
    entries: HashMap<RequestId, ShardId>,
    order: VecDeque<RequestId>,
    max_size: usize,
}

impl OrderLocator {
    /// # Panics
    /// Panics if `max_size` is zero.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "OrderLocator max_size must be > 0");
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    pub fn insert(&mut self, order_id: RequestId, shard: ShardId) {
        if let Some(slot) = self.entries.get_mut(&order_id) {
            *slot = shard;
            return;
        }
        if self.entries.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(order_id.clone(), shard);
        self.order.push_back(order_id);
    }

    #[must_use]
    pub fn get(&self, order_id: &RequestId) -> Option<ShardId> {
        self.entries.get(order_id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =====================================================================
// Router
// =====================================================================

/// Chooses the shard for each command.
#[derive(Debug)]
pub struct Router {
    shard_count: u32,
    locator: OrderLocator,
}

impl Router {
    #[must_use]
    pub fn new(shard_count: u32, locator_capacity: usize) -> Self {
        Self {
            shard_count,
            locator: OrderLocator::new(locator_capacity),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    #[must_use]
    pub fn shard_for_target(&self, target: &Target) -> ShardId {
        shard_for(target, self.shard_count)
    }

    /// Remember that `order_id` lives on `shard` (used when restoring).
    pub fn remember(&mut self, order_id: RequestId, shard: ShardId) {
        self.locator.insert(order_id, shard);
    }

    #[must_use]
    pub fn locator(&self) -> &OrderLocator {
        &self.locator
    }

    /// Pick the shard for `command` and record the order it introduces.
    ///
    /// - Place goes to the target's owner.
    /// - Cancel and Update follow the original order; if it is unknown they
    ///   go to [`shard_for_unknown`], which answers `NotFound`.
    pub fn route(&mut self, command: &Command) -> ShardId {
        let shard = match command {
            Command::PlaceBuy(p) | Command::PlaceSell(p) => self.shard_for_target(&p.target),
            Command::Cancel(c) => self.follow(&c.original_request_id),
            Command::UpdateBuy(u) | Command::UpdateSell(u) => self.follow(&u.original_request_id),
        };
        if command.new_order().is_some() {
            self.locator.insert(command.request_id().clone(), shard);
        }
        shard
    }

    fn follow(&self, original: &RequestId) -> ShardId {
        self.locator
            .get(original)
            .unwrap_or_else(|| shard_for_unknown(original, self.shard_count))
    }
}

#[cfg(test)]
mod tests {
    use dealbook_types::Side;

    use super::*;

    #[test]
    fn routing_is_deterministic_and_in_range() {
        for symbol in ["AAPL", "MSFT", "BTC-KRW", "ETH-KRW", "TSLA"] {
            let target = Target::new(symbol);
            let a = shard_for(&target, 4);
            assert_eq!(a, shard_for(&target, 4));
            assert!(a.0 < 4);
        }
        assert_eq!(shard_for(&Target::new("AAPL"), 1), ShardId(0));
    }

    #[test]
    fn targets_spread_over_shards() {
        let used: std::collections::HashSet<ShardId> = (0..64)
            .map(|i| shard_for(&Target::new(format!("SYM{i}")), 4))
            .collect();
        assert!(used.len() > 1);
    }

    #[test]
    fn cancel_follows_placed_order() {
        let mut router = Router::new(8, 100);
        let place = Command::place(Side::Buy, "r-1", "alice", "AAPL", 1, 100);
        let placed_on = router.route(&place);
        assert_eq!(placed_on, shard_for(&Target::new("AAPL"), 8));

        let cancel = Command::cancel("c-1", "alice", "r-1");
        assert_eq!(router.route(&cancel), placed_on);
        assert!(router.locator().get(&RequestId::new("c-1")).is_none());
    }

    #[test]
    fn update_registers_replacement() {
        let mut router = Router::new(8, 100);
        let shard = router.route(&Command::place(Side::Sell, "r-1", "alice", "AAPL", 1, 100));
        router.route(&Command::update(Side::Sell, "u-1", "alice", "r-1", "AAPL", 2, 101));
        assert_eq!(router.locator().get(&RequestId::new("u-1")), Some(shard));
    }

    #[test]
    fn unknown_original_uses_stable_fallback() {
        let mut router = Router::new(8, 100);
        let cancel = Command::cancel("c-1", "alice", "ghost");
        let a = router.route(&cancel);
        let b = router.route(&cancel);
        assert_eq!(a, b);
        assert_eq!(a, shard_for_unknown(&RequestId::new("ghost"), 8));
    }

    #[test]
    fn locator_evicts_oldest() {
        let mut locator = OrderLocator::new(2);
        locator.insert(RequestId::new("a"), ShardId(0));
        locator.insert(RequestId::new("b"), ShardId(1));
        locator.insert(RequestId::new("c"), ShardId(2));
        assert_eq!(locator.len(), 2);
        assert!(locator.get(&RequestId::new("a")).is_none());
        assert_eq!(locator.get(&RequestId::new("c")), Some(ShardId(2)));
    }
}
