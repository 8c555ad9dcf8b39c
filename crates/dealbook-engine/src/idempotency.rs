//! Redelivery detection.
//!
//! Two layers keep a command with a given `(user_id, request_id)` from being
//! applied twice:
//!
//! - [`ReceiptLedger`]: a bounded, per-shard record of recent receipts. It is
//!   part of every shard snapshot, so it survives restarts together with the
//!   books it describes.
//! - [`IdempotencyStore`]: the shared store all shards consult before
//!   applying a command. [`MemoryIdempotencyStore`] is the in-process
//!   implementation; claims that never receive a result expire after a TTL.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dealbook_types::{IdempotencyKey, Receipt, Result};

// =====================================================================
// ReceiptLedger
// =====================================================================

/// Bounded map of idempotency keys to receipts with FIFO eviction.
///
/// When the ledger reaches `max_size`, the oldest receipt is evicted to
/// make room.
#[derive(Debug, Clone)]
pub struct ReceiptLedger {
    receipts: HashMap<IdempotencyKey, Receipt>,
    /// Insertion order for eviction (front = oldest).
    order: VecDeque<IdempotencyKey>,
    max_size: usize,
}

impl ReceiptLedger {
    /// # Panics
    /// Panics if `max_size` is zero.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "ReceiptLedger max_size must be > 0");
        Self {
            receipts: HashMap::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    #[must_use]
    pub fn get(&self, key: &IdempotencyKey) -> Option<&Receipt> {
        self.receipts.get(key)
    }

    /// Remember `receipt` under its key. Re-recording a key replaces the
    /// receipt without refreshing its age.
    pub fn record(&mut self, receipt: Receipt) {
        let key = receipt.key.clone();
        if let Some(slot) = self.receipts.get_mut(&key) {
            *slot = receipt;
            return;
        }

        if self.receipts.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.receipts.remove(&oldest);
            }
        }

        self.receipts.insert(key.clone(), receipt);
        self.order.push_back(key);
    }

    /// Receipts from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Receipt> {
        self.order.iter().filter_map(|k| self.receipts.get(k))
    }

    /// Rebuild from receipts listed oldest first.
    pub fn restore(&mut self, receipts: Vec<Receipt>) {
        self.receipts.clear();
        self.order.clear();
        for receipt in receipts {
            self.record(receipt);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

// =====================================================================
// IdempotencyStore
// =====================================================================

/// Answer to [`IdempotencyStore::try_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// The caller now holds the claim on this key.
    pub first_claim: bool,
    /// Result recorded by whoever applied the command before.
    pub prior_result: Option<Receipt>,
}

impl Claim {
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            first_claim: true,
            prior_result: None,
        }
    }
}

/// Shared store consulted before a command is applied.
///
/// Implementations must be safe for concurrent use by every shard.
pub trait IdempotencyStore: Send + Sync {
    /// Claim `key`, or learn that it was already claimed.
    fn try_claim(&self, key: &IdempotencyKey) -> Result<Claim>;

    /// Record the result of the command claimed under `key`.
    fn record(&self, key: &IdempotencyKey, receipt: &Receipt) -> Result<()>;

    /// Drop a claim that will never receive a result.
    fn release(&self, key: &IdempotencyKey) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Slot {
    claimed_at: Instant,
    receipt: Option<Receipt>,
}

/// In-memory [`IdempotencyStore`] backed by a [`DashMap`].
///
/// Recorded results are kept for the life of the store. Claims without a
/// result expire after `claim_ttl`, after which the key can be claimed
/// again.
#[derive(Debug)]
pub struct MemoryIdempotencyStore {
    entries: DashMap<IdempotencyKey, Slot>,
    claim_ttl: Duration,
}

impl MemoryIdempotencyStore {
    #[must_use]
    pub fn new(claim_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            claim_ttl,
        }
    }

    /// Number of keys claimed or recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded result for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &IdempotencyKey) -> Option<Receipt> {
        self.entries.get(key).and_then(|slot| slot.receipt.clone())
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn try_claim(&self, key: &IdempotencyKey) -> Result<Claim> {
        let now = Instant::now();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.receipt.is_none() && now.duration_since(slot.claimed_at) >= self.claim_ttl {
                    tracing::debug!(key = %key, "expired claim taken over");
                    slot.claimed_at = now;
                    return Ok(Claim::fresh());
                }
                Ok(Claim {
                    first_claim: false,
                    prior_result: slot.receipt.clone(),
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    claimed_at: now,
                    receipt: None,
                });
                Ok(Claim::fresh())
            }
        }
    }

    fn record(&self, key: &IdempotencyKey, receipt: &Receipt) -> Result<()> {
        let mut stored = receipt.clone();
        stored.replayed = false;
        self.entries
            .entry(key.clone())
            .and_modify(|slot| slot.receipt = Some(stored.clone()))
            .or_insert_with(|| Slot {
                claimed_at: Instant::now(),
                receipt: Some(stored),
            });
        Ok(())
    }

    fn release(&self, key: &IdempotencyKey) -> Result<()> {
        self.entries.remove_if(key, |_, slot| slot.receipt.is_none());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dealbook_types::*;

    use super::*;

    fn key(req: &str) -> IdempotencyKey {
        IdempotencyKey::new(UserId::new("alice"), RequestId::new(req))
    }

    fn receipt(req: &str) -> Receipt {
        Receipt {
            key: key(req),
            command: "cancel".into(),
            shard: ShardId(0),
            epoch: EpochId::default(),
            target: None,
            command_sequence: 0,
            outcome: Outcome::NotFound {
                order_id: RequestId::new("x"),
            },
            replayed: false,
        }
    }

    #[test]
    fn ledger_records_and_finds() {
        let mut ledger = ReceiptLedger::new(10);
        ledger.record(receipt("r-1"));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.get(&key("r-1")).is_some());
        assert!(ledger.get(&key("r-2")).is_none());
    }

    #[test]
    fn ledger_evicts_oldest() {
        let mut ledger = ReceiptLedger::new(3);
        for r in ["r-1", "r-2", "r-3", "r-4"] {
            ledger.record(receipt(r));
        }
        assert_eq!(ledger.len(), 3);
        assert!(ledger.get(&key("r-1")).is_none(), "r-1 should have been evicted");
        let keys: Vec<String> = ledger.iter().map(|r| r.key.request_id.0.clone()).collect();
        assert_eq!(keys, vec!["r-2", "r-3", "r-4"]);
    }

    #[test]
    fn ledger_rerecord_does_not_grow() {
        let mut ledger = ReceiptLedger::new(3);
        ledger.record(receipt("r-1"));
        ledger.record(receipt("r-1"));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.iter().count(), 1);
    }

    #[test]
    fn ledger_restore_keeps_newest_when_over_capacity() {
        let mut ledger = ReceiptLedger::new(2);
        ledger.restore(vec![receipt("a"), receipt("b"), receipt("c")]);
        assert!(ledger.get(&key("a")).is_none());
        assert!(ledger.get(&key("c")).is_some());
    }

    #[test]
    #[should_panic(expected = "max_size must be > 0")]
    fn zero_max_size_panics() {
        let _ = ReceiptLedger::new(0);
    }

    #[test]
    fn store_first_claim_then_duplicate() {
        let store = MemoryIdempotencyStore::new(Duration::from_secs(300));
        assert!(store.try_claim(&key("r-1")).unwrap().first_claim);

        let second = store.try_claim(&key("r-1")).unwrap();
        assert!(!second.first_claim);
        assert!(second.prior_result.is_none(), "claim without result yet");

        store.record(&key("r-1"), &receipt("r-1")).unwrap();
        let third = store.try_claim(&key("r-1")).unwrap();
        assert!(!third.first_claim);
        assert_eq!(third.prior_result, Some(receipt("r-1")));
    }

    #[test]
    fn store_claim_expires() {
        let store = MemoryIdempotencyStore::new(Duration::ZERO);
        assert!(store.try_claim(&key("r-1")).unwrap().first_claim);
        assert!(store.try_claim(&key("r-1")).unwrap().first_claim);
    }

    #[test]
    fn recorded_results_do_not_expire() {
        let store = MemoryIdempotencyStore::new(Duration::ZERO);
        store.try_claim(&key("r-1")).unwrap();
        store.record(&key("r-1"), &receipt("r-1").into_replay()).unwrap();
        let claim = store.try_claim(&key("r-1")).unwrap();
        assert!(!claim.first_claim);
        assert!(!claim.prior_result.unwrap().replayed, "stored without replay flag");
    }

    #[test]
    fn release_only_drops_unrecorded_claims() {
        let store = MemoryIdempotencyStore::new(Duration::from_secs(300));
        store.try_claim(&key("r-1")).unwrap();
        store.release(&key("r-1")).unwrap();
        assert!(store.is_empty());

        store.record(&key("r-2"), &receipt("r-2")).unwrap();
        store.release(&key("r-2")).unwrap();
        assert!(store.get(&key("r-2")).is_some());
    }

    #[test]
    fn store_is_shared_across_threads() {
        let store = std::sync::Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(300)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.try_claim(&key("race")).unwrap().first_claim)
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(winners, 1, "exactly one thread wins the claim");
    }
}
