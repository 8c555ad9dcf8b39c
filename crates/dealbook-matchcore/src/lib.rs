//! # dealbook-matchcore
//!
//! **Pure price-time priority matching for Dealbook.**
//!
//! MatchCore is the compute plane: a per-target [`OrderBook`] and the
//! [`match_order`] function that executes an incoming limit order against
//! it. It has:
//!
//! - **Zero side effects**: no I/O, no clocks, no randomness
//! - **Deterministic output**: same book + same order -> same deals
//! - **Per-target books**: each target has its own independent book and counters

pub mod determinism;
pub mod matcher;
pub mod orderbook;
pub mod price_level;

pub use determinism::{compute_book_root, compute_deal_root, ensure_deal_root, verify_deal_root};
pub use matcher::{MatchOutcome, match_order};
pub use orderbook::{BookDepth, LevelSummary, OrderBook};
pub use price_level::PriceLevel;
