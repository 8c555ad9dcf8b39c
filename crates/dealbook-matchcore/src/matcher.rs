//! Continuous price-time priority matcher.
//!
//! ```text
//! match_order(&mut OrderBook, Order) -> MatchOutcome
//! ```
//!
//! The incoming order sweeps the opposite side from the best price
//! outwards while prices cross. Each fill trades the smaller of the two
//! remaining amounts at the **resting** order's price. Fully filled resting
//! orders leave the book; whatever remains of the incoming order rests
//! with a fresh sequence.
//!
//! There is no self-trade prevention: orders from the same user match
//! like any others.

use dealbook_types::{Amount, Deal, DealId, Order, Result, Side};

use crate::OrderBook;

/// Result of matching one incoming order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    /// The incoming order after matching. Rests in the book unless filled.
    pub order: Order,
    /// Deals in sweep order.
    pub deals: Vec<Deal>,
    /// Resting orders that were completely filled and removed.
    pub filled_makers: Vec<Order>,
}

impl MatchOutcome {
    /// Whether the incoming order is now resting in the book.
    #[must_use]
    pub fn rested(&self) -> bool {
        self.order.is_resting()
    }

    /// Total amount executed by the incoming order.
    #[must_use]
    pub fn filled_amount(&self) -> Amount {
        self.deals.iter().map(|d| d.amount).sum()
    }
}

/// Match `incoming` against `book`, mutating it.
///
/// The order is validated against the book before anything changes: an
/// error means the book is untouched.
///
/// Deals take their `executed_at` from `incoming.created_at`, so replaying
/// the same commands reproduces byte-identical deals.
pub fn match_order(book: &mut OrderBook, mut incoming: Order) -> Result<MatchOutcome> {
    book.check_insertable(&incoming)?;

    let opposite = incoming.side.opposite();
    let mut deals = Vec::new();
    let mut filled_makers = Vec::new();

    while incoming.remaining_amount > 0 {
        let Some(maker) = book.best_mut(opposite) else {
            break;
        };
        if !incoming.side.crosses(incoming.price, maker.price) {
            break;
        }

        let amount = incoming.remaining_amount.min(maker.remaining_amount);
        maker.fill(amount);
        let price = maker.price;
        let maker_id = maker.id.clone();
        let maker_user = maker.user_id.clone();
        let maker_done = maker.is_filled();

        incoming.fill(amount);

        let sequence = book.next_deal_sequence();
        let (buyer_id, seller_id, buy_order_id, sell_order_id) = match incoming.side {
            Side::Buy => (incoming.user_id.clone(), maker_user, incoming.id.clone(), maker_id),
            Side::Sell => (maker_user, incoming.user_id.clone(), maker_id, incoming.id.clone()),
        };
        let deal = Deal {
            id: DealId::deterministic(&incoming.target, sequence),
            target: incoming.target.clone(),
            amount,
            price,
            buyer_id,
            seller_id,
            buy_order_id,
            sell_order_id,
            sequence,
            taker_side: incoming.side,
            executed_at: incoming.created_at,
        };
        tracing::trace!(
            symbol = %deal.target,
            deal_sequence = sequence,
            amount,
            price,
            "deal executed"
        );
        deals.push(deal);

        if maker_done {
            if let Some(filled) = book.pop_best(opposite) {
                filled_makers.push(filled);
            }
        }
    }

    if incoming.remaining_amount > 0 {
        incoming.sequence = book.rest(incoming.clone())?;
    }

    Ok(MatchOutcome {
        order: incoming,
        deals,
        filled_makers,
    })
}
