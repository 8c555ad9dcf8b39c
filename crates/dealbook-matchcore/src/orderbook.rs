//! The order book for a single target.
//!
//! Uses `BTreeMap` for price-level ordering:
//! - **Bids** (buys): `BTreeMap<Reverse<Price>, PriceLevel>` -- highest price first
//! - **Asks** (sells): `BTreeMap<Price, PriceLevel>` -- lowest price first
//!
//! An auxiliary `HashMap<RequestId, (Side, Price)>` gives O(log N) removal.
//! The book also owns the per-target counters: order sequence (time
//! priority), command sequence and deal sequence.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use dealbook_types::*;
use serde::{Deserialize, Serialize};

use crate::price_level::PriceLevel;

/// Aggregated view of one price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSummary {
    pub price: Price,
    pub amount: Amount,
    pub orders: usize,
}

/// Top-of-book aggregation, best levels first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDepth {
    pub target: Target,
    pub bids: Vec<LevelSummary>,
    pub asks: Vec<LevelSummary>,
}

/// The order book for a single target.
#[derive(Debug)]
pub struct OrderBook {
    target: Target,
    bids: BTreeMap<Reverse<Price>, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    index: HashMap<RequestId, (Side, Price)>,
    last_order_sequence: u64,
    last_command_sequence: u64,
    last_deal_sequence: u64,
}

impl OrderBook {
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            last_order_sequence: 0,
            last_command_sequence: 0,
            last_deal_sequence: 0,
        }
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    // =================================================================
    // Insertion
    // =================================================================

    /// Check that `order` may rest in this book.
    pub fn check_insertable(&self, order: &Order) -> Result<()> {
        if order.target != self.target {
            return Err(DealbookError::TargetMismatch {
                book_target: self.target.clone(),
                order_target: order.target.clone(),
            });
        }
        if order.price <= 0 {
            return Err(DealbookError::InvalidOrder {
                reason: format!("order {} has non-positive price {}", order.id, order.price),
            });
        }
        if order.remaining_amount <= 0 || order.remaining_amount > order.original_amount {
            return Err(DealbookError::InvalidOrder {
                reason: format!(
                    "order {} has remaining {} of original {}",
                    order.id, order.remaining_amount, order.original_amount
                ),
            });
        }
        if !order.status.is_live() {
            return Err(DealbookError::InvalidOrder {
                reason: format!("order {} has status {}", order.id, order.status),
            });
        }
        if self.index.contains_key(&order.id) {
            return Err(DealbookError::DuplicateOrder(order.id.clone()));
        }
        Ok(())
    }

    /// Insert an order as-is, keeping its sequence.
    ///
    /// The order sequence counter is raised to at least `order.sequence`.
    pub fn insert(&mut self, order: Order) -> Result<()> {
        self.check_insertable(&order)?;

        let price = order.price;
        self.last_order_sequence = self.last_order_sequence.max(order.sequence);
        self.index.insert(order.id.clone(), (order.side, price));

        match order.side {
            Side::Buy => self
                .bids
                .entry(Reverse(price))
                .or_insert_with(|| PriceLevel::new(price))
                .insert(order),
            Side::Sell => self
                .asks
                .entry(price)
                .or_insert_with(|| PriceLevel::new(price))
                .insert(order),
        }
        Ok(())
    }

    /// Rest an order at the back of its level with the next sequence.
    /// Returns the assigned sequence.
    pub fn rest(&mut self, mut order: Order) -> Result<u64> {
        let sequence = self.last_order_sequence + 1;
        order.sequence = sequence;
        self.insert(order)?;
        Ok(sequence)
    }

    // =================================================================
    // Removal
    // =================================================================

    /// Remove an order by id. Returns the removed order unchanged.
    pub fn remove(&mut self, order_id: &RequestId) -> Result<Order> {
        let (side, price) = self
            .index
            .remove(order_id)
            .ok_or_else(|| DealbookError::OrderNotFound(order_id.clone()))?;

        let order = match side {
            Side::Buy => {
                let level = self
                    .bids
                    .get_mut(&Reverse(price))
                    .ok_or_else(|| DealbookError::OrderNotFound(order_id.clone()))?;
                let order = level
                    .remove_order(order_id)
                    .ok_or_else(|| DealbookError::OrderNotFound(order_id.clone()))?;
                if level.is_empty() {
                    self.bids.remove(&Reverse(price));
                }
                order
            }
            Side::Sell => {
                let level = self
                    .asks
                    .get_mut(&price)
                    .ok_or_else(|| DealbookError::OrderNotFound(order_id.clone()))?;
                let order = level
                    .remove_order(order_id)
                    .ok_or_else(|| DealbookError::OrderNotFound(order_id.clone()))?;
                if level.is_empty() {
                    self.asks.remove(&price);
                }
                order
            }
        };

        Ok(order)
    }

    // =================================================================
    // Queries
    // =================================================================

    /// Highest-priority buy order.
    #[must_use]
    pub fn best_bid(&self) -> Option<&Order> {
        self.bids.values().next().and_then(PriceLevel::front)
    }

    /// Highest-priority sell order.
    #[must_use]
    pub fn best_ask(&self) -> Option<&Order> {
        self.asks.values().next().and_then(PriceLevel::front)
    }

    #[must_use]
    pub fn best_bid_price(&self) -> Option<Price> {
        self.bids.keys().next().map(|r| r.0)
    }

    #[must_use]
    pub fn best_ask_price(&self) -> Option<Price> {
        self.asks.keys().next().copied()
    }

    /// best ask - best bid. `None` if either side is empty.
    #[must_use]
    pub fn spread(&self) -> Option<Price> {
        match (self.best_bid_price(), self.best_ask_price()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Whether best bid >= best ask. Never true between commands.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        matches!(self.spread(), Some(s) if s <= 0)
    }

    #[must_use]
    pub fn get(&self, order_id: &RequestId) -> Option<&Order> {
        let (side, price) = self.index.get(order_id)?;
        match side {
            Side::Buy => self.bids.get(&Reverse(*price))?.get(order_id),
            Side::Sell => self.asks.get(price)?.get(order_id),
        }
    }

    #[must_use]
    pub fn contains_order(&self, order_id: &RequestId) -> bool {
        self.index.contains_key(order_id)
    }

    #[must_use]
    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    /// Number of distinct bid price levels.
    #[must_use]
    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    /// Number of distinct ask price levels.
    #[must_use]
    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Aggregate the best `levels` price levels on each side.
    #[must_use]
    pub fn depth(&self, levels: usize) -> BookDepth {
        let summarize = |level: &PriceLevel| LevelSummary {
            price: level.price,
            amount: level.total_amount(),
            orders: level.len(),
        };
        BookDepth {
            target: self.target.clone(),
            bids: self.bids.values().take(levels).map(summarize).collect(),
            asks: self.asks.values().take(levels).map(summarize).collect(),
        }
    }

    /// Iterate bid levels from best (highest) to worst.
    pub fn bid_levels(&self) -> impl Iterator<Item = &PriceLevel> {
        self.bids.values()
    }

    /// Iterate ask levels from best (lowest) to worst.
    pub fn ask_levels(&self) -> impl Iterator<Item = &PriceLevel> {
        self.asks.values()
    }

    // =================================================================
    // Matcher access
    // =================================================================

    /// Mutable access to the highest-priority order on `side`.
    pub(crate) fn best_mut(&mut self, side: Side) -> Option<&mut Order> {
        match side {
            Side::Buy => self.bids.values_mut().next()?.front_mut(),
            Side::Sell => self.asks.values_mut().next()?.front_mut(),
        }
    }

    /// Remove the highest-priority order on `side`.
    pub(crate) fn pop_best(&mut self, side: Side) -> Option<Order> {
        let order = match side {
            Side::Buy => {
                let mut entry = self.bids.first_entry()?;
                let order = entry.get_mut().pop_front();
                if entry.get().is_empty() {
                    entry.remove();
                }
                order
            }
            Side::Sell => {
                let mut entry = self.asks.first_entry()?;
                let order = entry.get_mut().pop_front();
                if entry.get().is_empty() {
                    entry.remove();
                }
                order
            }
        }?;
        self.index.remove(&order.id);
        Some(order)
    }

    // =================================================================
    // Sequences
    // =================================================================

    #[must_use]
    pub fn last_order_sequence(&self) -> u64 {
        self.last_order_sequence
    }

    #[must_use]
    pub fn last_command_sequence(&self) -> u64 {
        self.last_command_sequence
    }

    #[must_use]
    pub fn last_deal_sequence(&self) -> u64 {
        self.last_deal_sequence
    }

    /// Allocate the sequence of the next command applied to this book.
    pub fn next_command_sequence(&mut self) -> u64 {
        self.last_command_sequence += 1;
        self.last_command_sequence
    }

    pub(crate) fn next_deal_sequence(&mut self) -> u64 {
        self.last_deal_sequence += 1;
        self.last_deal_sequence
    }

    // =================================================================
    // Snapshot / restore
    // =================================================================

    /// All resting orders: bids best to worst, then asks best to worst,
    /// each level in sequence order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Order> {
        self.bids
            .values()
            .chain(self.asks.values())
            .flat_map(|level| level.orders.iter().cloned())
            .collect()
    }

    /// Replace the book's contents with `orders`.
    ///
    /// Every order must satisfy the resting invariants, carry a sequence no
    /// greater than `last_sequence`, and the result must not be crossed.
    /// On error the book is left empty.
    pub fn restore(&mut self, orders: Vec<Order>, last_sequence: u64) -> Result<()> {
        self.bids.clear();
        self.asks.clear();
        self.index.clear();
        self.last_order_sequence = 0;

        let outcome = self.restore_inner(orders, last_sequence);
        if outcome.is_err() {
            self.bids.clear();
            self.asks.clear();
            self.index.clear();
            self.last_order_sequence = 0;
        }
        outcome
    }

    fn restore_inner(&mut self, orders: Vec<Order>, last_sequence: u64) -> Result<()> {
        for order in orders {
            if order.sequence == 0 || order.sequence > last_sequence {
                return Err(DealbookError::InvalidOrder {
                    reason: format!(
                        "order {} has sequence {} outside 1..={last_sequence}",
                        order.id, order.sequence
                    ),
                });
            }
            self.insert(order)?;
        }
        if self.is_crossed() {
            return Err(DealbookError::InvalidOrder {
                reason: format!("restored book for {} is crossed", self.target),
            });
        }
        self.last_order_sequence = last_sequence;
        Ok(())
    }

    /// Restore the command and deal counters.
    pub fn restore_counters(&mut self, last_command_sequence: u64, last_deal_sequence: u64) {
        self.last_command_sequence = last_command_sequence;
        self.last_deal_sequence = last_deal_sequence;
    }
}
