//! Order types for the Dealbook matching engine.
//!
//! Only simple limit orders exist. Prices and amounts are integers in the
//! minor currency unit; validation rejects non-positive values before an
//! order is ever built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RequestId, Target, UserId};

/// Price in the minor currency unit.
pub type Price = i64;

/// Order / deal quantity.
pub type Amount = i64;

/// Which side of the book this order is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side this order matches against.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Whether an order on this side at `limit` trades with a resting
    /// order priced at `resting`.
    #[must_use]
    pub fn crosses(self, limit: Price, resting: Price) -> bool {
        match self {
            Self::Buy => resting <= limit,
            Self::Sell => resting >= limit,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    /// Statuses an order may have while it sits in a book.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A resting or incoming limit order.
///
/// The order's identity is the request id of the command that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: RequestId,
    pub user_id: UserId,
    pub target: Target,
    pub side: Side,
    pub price: Price,
    pub original_amount: Amount,
    pub remaining_amount: Amount,
    /// Per-target time-priority counter; 0 until the order rests.
    pub sequence: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// A fresh, unsequenced order as it enters the matcher.
    #[must_use]
    pub fn new(
        id: RequestId,
        user_id: UserId,
        target: Target,
        side: Side,
        price: Price,
        amount: Amount,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            target,
            side,
            price,
            original_amount: amount,
            remaining_amount: amount,
            sequence: 0,
            status: OrderStatus::Open,
            created_at,
        }
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.remaining_amount == 0
    }

    #[must_use]
    pub fn filled_amount(&self) -> Amount {
        self.original_amount - self.remaining_amount
    }

    /// Whether this order satisfies the "present in a book" invariant.
    #[must_use]
    pub fn is_resting(&self) -> bool {
        self.status.is_live() && self.remaining_amount > 0
    }

    /// Fill up to `amount` units and update the status.
    ///
    /// Returns the amount actually filled, never more than what remains.
    pub fn fill(&mut self, amount: Amount) -> Amount {
        let filled = amount.clamp(0, self.remaining_amount);
        self.remaining_amount -= filled;
        self.status = if self.remaining_amount == 0 {
            OrderStatus::Filled
        } else if self.remaining_amount < self.original_amount {
            OrderStatus::PartiallyFilled
        } else {
            self.status
        };
        filled
    }

    /// Mark the order cancelled. The remaining amount is kept for reporting.
    pub fn cancel(&mut self) {
        self.status = OrderStatus::Cancelled;
    }
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl Order {
    pub fn dummy_limit(id: &str, side: Side, price: Price, amount: Amount) -> Self {
        Self::new(
            RequestId::new(id),
            UserId::new(format!("user-{id}")),
            Target::new("AAPL"),
            side,
            price,
            amount,
            DateTime::<Utc>::UNIX_EPOCH,
        )
    }

    pub fn dummy_limit_for_user(
        id: &str,
        user: &str,
        side: Side,
        price: Price,
        amount: Amount,
    ) -> Self {
        let mut order = Self::dummy_limit(id, side, price, amount);
        order.user_id = UserId::new(user);
        order
    }
}
