//! # dealbook-types
//!
//! Shared types, errors, and configuration for the **Dealbook** matching engine.
//!
//! This crate is the leaf dependency of the workspace. It defines:
//!
//! - **Identifiers**: [`RequestId`], [`UserId`], [`Target`], [`IdempotencyKey`], [`DealId`], [`ShardId`], [`EpochId`]
//! - **Order model**: [`Order`], [`Side`], [`OrderStatus`], [`Price`], [`Amount`]
//! - **Deal model**: [`Deal`], [`DealBatch`]
//! - **Commands**: [`Command`] and its payloads
//! - **Receipts**: [`Receipt`], [`Outcome`]
//! - **Configuration**: [`EngineConfig`], [`RetryPolicy`]
//! - **Errors**: [`DealbookError`] with `DBK_ERR_` prefix codes, and [`Rejection`]
//! - **Constants**: defaults and format versions

pub mod command;
pub mod config;
pub mod constants;
pub mod deal;
pub mod error;
pub mod ids;
pub mod order;
pub mod receipt;

pub use command::*;
pub use config::*;
pub use deal::*;
pub use error::*;
pub use ids::*;
pub use order::*;
pub use receipt::*;

// Constants are accessed via `dealbook_types::constants::FOO`.
