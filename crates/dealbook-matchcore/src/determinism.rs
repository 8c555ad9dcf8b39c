//! Determinism verification utilities.
//!
//! Replaying the same command stream against the same starting book must
//! produce the exact same deals and the exact same resting state. The
//! roots below are SHA-256 digests that make that comparison cheap.

use dealbook_types::{Deal, DealbookError, Order, Result};
use sha2::{Digest, Sha256};

use crate::OrderBook;

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_order(hasher: &mut Sha256, order: &Order) {
    hash_str(hasher, order.id.as_str());
    hash_str(hasher, order.user_id.as_str());
    hasher.update([u8::from(order.side == dealbook_types::Side::Buy)]);
    hasher.update(order.price.to_le_bytes());
    hasher.update(order.original_amount.to_le_bytes());
    hasher.update(order.remaining_amount.to_le_bytes());
    hasher.update(order.sequence.to_le_bytes());
}

/// Digest over an ordered list of deals.
///
/// Depends on deal ids, sequences, parties, prices and amounts. The same
/// deals in the same order always produce the same root.
#[must_use]
pub fn compute_deal_root(deals: &[Deal]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"dealbook:deal_root:v1:");
    hasher.update((deals.len() as u64).to_le_bytes());

    for deal in deals {
        hasher.update(deal.id.0.as_bytes());
        hash_str(&mut hasher, deal.target.as_str());
        hasher.update(deal.sequence.to_le_bytes());
        hash_str(&mut hasher, deal.buy_order_id.as_str());
        hash_str(&mut hasher, deal.sell_order_id.as_str());
        hash_str(&mut hasher, deal.buyer_id.as_str());
        hash_str(&mut hasher, deal.seller_id.as_str());
        hasher.update(deal.price.to_le_bytes());
        hasher.update(deal.amount.to_le_bytes());
    }

    hasher.finalize().into()
}

/// Recompute the root over `deals` and compare with `expected_root`.
#[must_use]
pub fn verify_deal_root(deals: &[Deal], expected_root: &[u8; 32]) -> bool {
    compute_deal_root(deals) == *expected_root
}

/// Like [`verify_deal_root`], but reports a mismatch as an error.
pub fn ensure_deal_root(deals: &[Deal], expected_root: &[u8; 32]) -> Result<()> {
    let actual = compute_deal_root(deals);
    if actual == *expected_root {
        Ok(())
    } else {
        Err(DealbookError::DeterminismViolation {
            expected: hex::encode(expected_root),
            actual: hex::encode(actual),
        })
    }
}

/// Digest over a book's resting orders (in snapshot order) and counters.
#[must_use]
pub fn compute_book_root(book: &OrderBook) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"dealbook:book_root:v1:");
    hash_str(&mut hasher, book.target().as_str());
    hasher.update(book.last_order_sequence().to_le_bytes());
    hasher.update(book.last_command_sequence().to_le_bytes());
    hasher.update(book.last_deal_sequence().to_le_bytes());

    let orders = book.snapshot();
    hasher.update((orders.len() as u64).to_le_bytes());
    for order in &orders {
        hash_order(&mut hasher, order);
    }

    hasher.finalize().into()
}
