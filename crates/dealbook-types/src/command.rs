//! Inbound commands.
//!
//! A [`Command`] is the unit of work an engine shard applies. The set is
//! closed; the wire form is internally tagged by `"type"`:
//!
//! ```json
//! {"type":"place_buy","request_id":"r-1","user_id":"alice",
//!  "target":"AAPL","amount":10,"price":100,"issued_at":"2024-01-01T00:00:00Z"}
//! ```
//!
//! `issued_at` is required on the wire. It becomes the `executed_at` of
//! every deal the command produces, so a command re-applied after a crash
//! regenerates identical deals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Amount, IdempotencyKey, Order, Price, Rejection, RequestId, Side, Target, UserId};

/// Place a new limit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub target: Target,
    pub amount: Amount,
    pub price: Price,
    pub issued_at: DateTime<Utc>,
}

/// Cancel a resting order by the request id that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub original_request_id: RequestId,
    pub issued_at: DateTime<Utc>,
}

/// Replace a resting order with a new one keyed by this request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOrder {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub original_request_id: RequestId,
    pub target: Target,
    pub amount: Amount,
    pub price: Price,
    pub issued_at: DateTime<Utc>,
}

/// Every command the engine understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    PlaceBuy(PlaceOrder),
    PlaceSell(PlaceOrder),
    Cancel(CancelOrder),
    UpdateBuy(UpdateOrder),
    UpdateSell(UpdateOrder),
}

impl Command {
    // -----------------------------------------------------------------
    // Constructors (stamped with the current time)
    // -----------------------------------------------------------------

    #[must_use]
    pub fn place(
        side: Side,
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        target: impl Into<String>,
        amount: Amount,
        price: Price,
    ) -> Self {
        let place = PlaceOrder {
            request_id: RequestId::new(request_id),
            user_id: UserId::new(user_id),
            target: Target::new(target),
            amount,
            price,
            issued_at: Utc::now(),
        };
        match side {
            Side::Buy => Self::PlaceBuy(place),
            Side::Sell => Self::PlaceSell(place),
        }
    }

    #[must_use]
    pub fn cancel(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        original_request_id: impl Into<String>,
    ) -> Self {
        Self::Cancel(CancelOrder {
            request_id: RequestId::new(request_id),
            user_id: UserId::new(user_id),
            original_request_id: RequestId::new(original_request_id),
            issued_at: Utc::now(),
        })
    }

    #[must_use]
    pub fn update(
        side: Side,
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        original_request_id: impl Into<String>,
        target: impl Into<String>,
        amount: Amount,
        price: Price,
    ) -> Self {
        let update = UpdateOrder {
            request_id: RequestId::new(request_id),
            user_id: UserId::new(user_id),
            original_request_id: RequestId::new(original_request_id),
            target: Target::new(target),
            amount,
            price,
            issued_at: Utc::now(),
        };
        match side {
            Side::Buy => Self::UpdateBuy(update),
            Side::Sell => Self::UpdateSell(update),
        }
    }

    /// Override the issue time (replays and tests).
    #[must_use]
    pub fn with_issued_at(mut self, at: DateTime<Utc>) -> Self {
        match &mut self {
            Self::PlaceBuy(p) | Self::PlaceSell(p) => p.issued_at = at,
            Self::Cancel(c) => c.issued_at = at,
            Self::UpdateBuy(u) | Self::UpdateSell(u) => u.issued_at = at,
        }
        self
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::PlaceBuy(p) | Self::PlaceSell(p) => &p.request_id,
            Self::Cancel(c) => &c.request_id,
            Self::UpdateBuy(u) | Self::UpdateSell(u) => &u.request_id,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        match self {
            Self::PlaceBuy(p) | Self::PlaceSell(p) => &p.user_id,
            Self::Cancel(c) => &c.user_id,
            Self::UpdateBuy(u) | Self::UpdateSell(u) => &u.user_id,
        }
    }

    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        match self {
            Self::PlaceBuy(p) | Self::PlaceSell(p) => p.issued_at,
            Self::Cancel(c) => c.issued_at,
            Self::UpdateBuy(u) | Self::UpdateSell(u) => u.issued_at,
        }
    }

    /// The idempotency key `(user_id, request_id)`.
    #[must_use]
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.user_id().clone(), self.request_id().clone())
    }

    /// The target named by the command. Cancels carry none.
    #[must_use]
    pub fn target(&self) -> Option<&Target> {
        match self {
            Self::PlaceBuy(p) | Self::PlaceSell(p) => Some(&p.target),
            Self::Cancel(_) => None,
            Self::UpdateBuy(u) | Self::UpdateSell(u) => Some(&u.target),
        }
    }

    /// Side of the order the command places or replaces.
    #[must_use]
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::PlaceBuy(_) | Self::UpdateBuy(_) => Some(Side::Buy),
            Self::PlaceSell(_) | Self::UpdateSell(_) => Some(Side::Sell),
            Self::Cancel(_) => None,
        }
    }

    /// Id of the resting order a Cancel or Update refers to.
    #[must_use]
    pub fn original_request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Cancel(c) => Some(&c.original_request_id),
            Self::UpdateBuy(u) | Self::UpdateSell(u) => Some(&u.original_request_id),
            Self::PlaceBuy(_) | Self::PlaceSell(_) => None,
        }
    }

    /// Wire name of the variant, used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlaceBuy(_) => "place_buy",
            Self::PlaceSell(_) => "place_sell",
            Self::Cancel(_) => "cancel",
            Self::UpdateBuy(_) => "update_buy",
            Self::UpdateSell(_) => "update_sell",
        }
    }

    /// The fresh order a Place or Update would introduce.
    #[must_use]
    pub fn new_order(&self) -> Option<Order> {
        let side = self.side()?;
        let (request_id, user_id, target, amount, price, issued_at) = match self {
            Self::PlaceBuy(p) | Self::PlaceSell(p) => {
                (&p.request_id, &p.user_id, &p.target, p.amount, p.price, p.issued_at)
            }
            Self::UpdateBuy(u) | Self::UpdateSell(u) => {
                (&u.request_id, &u.user_id, &u.target, u.amount, u.price, u.issued_at)
            }
            Self::Cancel(_) => return None,
        };
        Some(Order::new(
            request_id.clone(),
            user_id.clone(),
            target.clone(),
            side,
            price,
            amount,
            issued_at,
        ))
    }

    // -----------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------

    /// Structural checks that need no book state.
    pub fn validate(&self) -> Result<(), Rejection> {
        if self.request_id().is_empty() {
            return Err(Rejection::validation("request_id must not be empty"));
        }
        if self.user_id().is_empty() {
            return Err(Rejection::validation("user_id must not be empty"));
        }
        if self.target().is_some_and(Target::is_empty) {
            return Err(Rejection::validation("target must not be empty"));
        }
        if let Some(original) = self.original_request_id() {
            if original.is_empty() {
                return Err(Rejection::validation(
                    "original_request_id must not be empty",
                ));
            }
            if original == self.request_id() {
                return Err(Rejection::validation(
                    "request_id must differ from original_request_id",
                ));
            }
        }
        match self {
            Self::PlaceBuy(PlaceOrder { amount, price, .. })
            | Self::PlaceSell(PlaceOrder { amount, price, .. })
            | Self::UpdateBuy(UpdateOrder { amount, price, .. })
            | Self::UpdateSell(UpdateOrder { amount, price, .. }) => {
                check_price_amount(*price, *amount)
            }
            Self::Cancel(_) => Ok(()),
        }
    }
}

fn check_price_amount(price: Price, amount: Amount) -> Result<(), Rejection> {
    if price <= 0 {
        return Err(Rejection::validation(format!(
            "price must be positive, got {price}"
        )));
    }
    if amount <= 0 {
        return Err(Rejection::validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name(), self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OrderStatus, RejectKind};

    #[test]
    fn wire_form_is_internally_tagged() {
        let json = r#"{"type":"place_sell","request_id":"r-1","user_id":"alice",
            "target":"AAPL","amount":10,"price":100,"issued_at":"2024-01-01T00:00:00Z"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.side(), Some(Side::Sell));
        assert_eq!(cmd.target(), Some(&Target::new("AAPL")));
        assert_eq!(cmd.name(), "place_sell");

        let out = serde_json::to_string(&cmd).unwrap();
        assert!(out.contains("\"type\":\"place_sell\""));
    }

    #[test]
    fn issued_at_is_required() {
        let json = r#"{"type":"cancel","request_id":"c-1","user_id":"bob","original_request_id":"r-1"}"#;
        let err = serde_json::from_str::<Command>(json).unwrap_err();
        assert!(err.to_string().contains("issued_at"), "Got: {err}");

        let json = r#"{"type":"cancel","request_id":"c-1","user_id":"bob","original_request_id":"r-1",
            "issued_at":"2024-01-01T00:00:00Z"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert!(cmd.target().is_none());
        assert_eq!(cmd.original_request_id(), Some(&RequestId::new("r-1")));
    }

    #[test]
    fn key_is_user_and_request() {
        let cmd = Command::cancel("c-1", "bob", "r-1");
        assert_eq!(cmd.key().to_string(), "bob/c-1");
        assert_eq!(cmd.to_string(), "cancel[bob/c-1]");
    }

    #[test]
    fn new_order_from_update_uses_update_request_id() {
        let cmd = Command::update(Side::Buy, "u-1", "alice", "r-1", "AAPL", 5, 101)
            .with_issued_at(DateTime::<Utc>::UNIX_EPOCH);
        let order = cmd.new_order().unwrap();
        assert_eq!(order.id, RequestId::new("u-1"));
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.remaining_amount, 5);
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.created_at, DateTime::<Utc>::UNIX_EPOCH);
        assert!(Command::cancel("c", "u", "r").new_order().is_none());
    }

    #[test]
    fn validation_rejects_non_positive_values() {
        let zero_price = Command::place(Side::Buy, "r-1", "alice", "AAPL", 10, 0);
        let rej = zero_price.validate().unwrap_err();
        assert_eq!(rej.kind, RejectKind::Validation);
        assert!(rej.reason.contains("price"));

        let neg_amount = Command::place(Side::Sell, "r-2", "alice", "AAPL", -3, 10);
        assert!(neg_amount.validate().unwrap_err().reason.contains("amount"));

        assert!(Command::place(Side::Sell, "r-3", "alice", "AAPL", 1, 1)
            .validate()
            .is_ok());
    }

    #[test]
    fn validation_rejects_empty_and_self_referencing_ids() {
        assert!(Command::place(Side::Buy, "", "alice", "AAPL", 1, 1).validate().is_err());
        assert!(Command::place(Side::Buy, "r", "", "AAPL", 1, 1).validate().is_err());
        assert!(Command::place(Side::Buy, "r", "alice", "", 1, 1).validate().is_err());
        assert!(Command::cancel("c", "alice", "").validate().is_err());
        assert!(Command::cancel("c", "alice", "c").validate().is_err());
        assert!(Command::cancel("c", "alice", "r").validate().is_ok());
    }
}
