//! Deal types produced by the matcher.
//!
//! A [`Deal`] is the immutable record of one fill between an incoming
//! order and a resting order, executed at the resting order's price.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Amount, DealId, Price, RequestId, ShardId, Side, Target, UserId};

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    /// Deterministic id derived from `(target, sequence)`.
    pub id: DealId,
    pub target: Target,
    pub amount: Amount,
    /// Execution price: always the resting order's price.
    pub price: Price,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub buy_order_id: RequestId,
    pub sell_order_id: RequestId,
    /// Per-target deal counter, starting at 1.
    pub sequence: u64,
    /// Side of the incoming (aggressive) order.
    pub taker_side: Side,
    /// Issue time of the command that produced this deal.
    pub executed_at: DateTime<Utc>,
}

impl Deal {
    /// Notional value in the minor currency unit.
    #[must_use]
    pub fn notional(&self) -> i128 {
        i128::from(self.price) * i128::from(self.amount)
    }

    /// The resting (maker) order of this deal.
    #[must_use]
    pub fn maker_order_id(&self) -> &RequestId {
        match self.taker_side {
            Side::Buy => &self.sell_order_id,
            Side::Sell => &self.buy_order_id,
        }
    }
}

impl std::fmt::Display for Deal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Deal[{}] {} {} {} @ {}",
            self.id, self.target, self.taker_side, self.amount, self.price,
        )
    }
}

/// All deals produced by one command, delivered to the sink atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealBatch {
    pub shard: ShardId,
    pub target: Target,
    /// Per-target sequence of the command that produced the batch.
    pub command_sequence: u64,
    pub deals: Vec<Deal>,
}

impl DealBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deals.len()
    }
}
