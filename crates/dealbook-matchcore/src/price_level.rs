//! A single price level in the order book.
//!
//! Orders at the same price are stored in time-priority order (ascending
//! `sequence`) using a [`VecDeque`].

use std::collections::VecDeque;

use dealbook_types::{Amount, Order, Price, RequestId};

/// All resting orders at one price.
///
/// The front of the deque has the lowest sequence and is filled first.
#[derive(Debug, Clone)]
pub struct PriceLevel {
    pub price: Price,
    pub orders: VecDeque<Order>,
}

impl PriceLevel {
    #[must_use]
    pub fn new(price: Price) -> Self {
        Self {
            price,
            orders: VecDeque::new(),
        }
    }

    /// Add an order at the position its sequence dictates.
    ///
    /// Freshly rested orders always carry the highest sequence and land at
    /// the back; restored orders may arrive in any order.
    pub fn insert(&mut self, order: Order) {
        let pos = self.orders.partition_point(|o| o.sequence < order.sequence);
        if pos == self.orders.len() {
            self.orders.push_back(order);
        } else {
            self.orders.insert(pos, order);
        }
    }

    pub fn pop_front(&mut self) -> Option<Order> {
        self.orders.pop_front()
    }

    #[must_use]
    pub fn front(&self) -> Option<&Order> {
        self.orders.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Order> {
        self.orders.front_mut()
    }

    /// Total remaining amount across all orders at this level.
    #[must_use]
    pub fn total_amount(&self) -> Amount {
        self.orders.iter().map(|o| o.remaining_amount).sum()
    }

    /// Remove a specific order by id.
    pub fn remove_order(&mut self, order_id: &RequestId) -> Option<Order> {
        let pos = self.orders.iter().position(|o| o.id == *order_id)?;
        self.orders.remove(pos)
    }

    #[must_use]
    pub fn get(&self, order_id: &RequestId) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == *order_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }
}
