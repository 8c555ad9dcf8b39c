//! Command receipts.
//!
//! Every applied command produces exactly one [`Receipt`]. Receipts are
//! what the idempotency layer records: a redelivered command is answered
//! with the stored receipt (flagged `replayed`) instead of being applied
//! again.

use serde::{Deserialize, Serialize};

use crate::{Deal, EpochId, IdempotencyKey, Order, Rejection, RequestId, ShardId, Target};

/// The business result of applying one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// A new order was matched; `order` is its state afterwards (it rests
    /// unless fully filled).
    Placed { order: Order, deals: Vec<Deal> },
    /// The resting order was removed.
    Cancelled { order: Order },
    /// The original order was removed and its replacement placed.
    Replaced {
        cancelled: Order,
        order: Order,
        deals: Vec<Deal>,
    },
    /// The referenced order is not resting (never existed, filled or
    /// already cancelled).
    NotFound { order_id: RequestId },
    /// The command was refused and nothing changed.
    Rejected(Rejection),
}

impl Outcome {
    /// Deals produced by the command, in execution order.
    #[must_use]
    pub fn deals(&self) -> &[Deal] {
        match self {
            Self::Placed { deals, .. } | Self::Replaced { deals, .. } => deals,
            _ => &[],
        }
    }

    /// Whether the command changed book state.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Placed { .. } | Self::Cancelled { .. } | Self::Replaced { .. }
        )
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Placed { .. } => "placed",
            Self::Cancelled { .. } => "cancelled",
            Self::Replaced { .. } => "replaced",
            Self::NotFound { .. } => "not_found",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Definitive answer to one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub key: IdempotencyKey,
    /// Wire name of the command (`place_buy`, `cancel`, ...).
    pub command: String,
    pub shard: ShardId,
    /// Incarnation of the shard that applied the command.
    #[serde(default)]
    pub epoch: EpochId,
    /// Target whose book the command was applied to, when resolved.
    pub target: Option<Target>,
    /// Per-target command sequence assigned when the command changed a
    /// book; 0 for rejections and misses.
    pub command_sequence: u64,
    pub outcome: Outcome,
    /// Set when this receipt answers a redelivered command.
    #[serde(default)]
    pub replayed: bool,
}

impl Receipt {
    #[must_use]
    pub fn deals(&self) -> &[Deal] {
        self.outcome.deals()
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, Outcome::Rejected(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.outcome, Outcome::NotFound { .. })
    }

    /// The same receipt, marked as an answer to a redelivery.
    #[must_use]
    pub fn into_replay(mut self) -> Self {
        self.replayed = true;
        self
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {} ({} deals{})",
            self.command,
            self.key,
            self.outcome.name(),
            self.deals().len(),
            if self.replayed { ", replayed" } else { "" },
        )
    }
}
