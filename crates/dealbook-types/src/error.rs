//! Error types for the Dealbook matching engine.
//!
//! All errors use the `DBK_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Command / order errors
//! - 2xx: Matching errors
//! - 3xx: Snapshot / recovery errors
//! - 4xx: Shard / runtime errors
//! - 5xx: Deal sink errors
//! - 9xx: General / internal errors
//!
//! Business outcomes of a command (a bad price, a cancel of someone else's
//! order) are *not* errors: they are recorded as a [`Rejection`] inside the
//! command's receipt so a redelivery is answered with the same result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{IdempotencyKey, RequestId, ShardId, Target};

/// Central error enum for all Dealbook operations.
#[derive(Debug, Error)]
pub enum DealbookError {
    // =================================================================
    // Command / Order Errors (1xx)
    // =================================================================
    /// The requested order was not found in the book.
    #[error("DBK_ERR_100: Order not found: {0}")]
    OrderNotFound(RequestId),

    /// The order failed structural validation.
    #[error("DBK_ERR_101: Invalid order: {reason}")]
    InvalidOrder { reason: String },

    /// An order with this id is already resting.
    #[error("DBK_ERR_102: Order already exists: {0}")]
    DuplicateOrder(RequestId),

    /// The order belongs to a different target than the book.
    #[error("DBK_ERR_103: Order for {order_target} offered to book {book_target}")]
    TargetMismatch {
        book_target: Target,
        order_target: Target,
    },

    // =================================================================
    // Matching Errors (2xx)
    // =================================================================
    /// Replaying the same commands produced a different deal stream.
    #[error("DBK_ERR_200: Determinism violation: expected {expected}, got {actual}")]
    DeterminismViolation { expected: String, actual: String },

    // =================================================================
    // Snapshot / Recovery Errors (3xx)
    // =================================================================
    /// The snapshot decoded but its contents violate a book invariant.
    #[error("DBK_ERR_300: Corrupt snapshot: {reason}")]
    CorruptSnapshot { reason: String },

    /// The snapshot body does not match its recorded checksum.
    #[error("DBK_ERR_301: Snapshot checksum mismatch: expected {expected}, got {actual}")]
    SnapshotIntegrity { expected: String, actual: String },

    /// The snapshot was written by an incompatible format version.
    #[error("DBK_ERR_302: Unsupported snapshot version {found} (supported: {supported})")]
    UnsupportedSnapshotVersion { found: u32, supported: u32 },

    /// The snapshot store could not read or write a snapshot.
    #[error("DBK_ERR_303: Snapshot store error: {0}")]
    SnapshotStore(String),

    // =================================================================
    // Shard / Runtime Errors (4xx)
    // =================================================================
    /// The shard has stopped and no longer accepts commands.
    #[error("DBK_ERR_400: Shard unavailable: {0}")]
    ShardUnavailable(ShardId),

    /// A command was delivered to a shard in the wrong state.
    #[error("DBK_ERR_401: Shard {shard} not ready (state {state})")]
    ShardNotReady { shard: ShardId, state: String },

    /// A command for `target` reached a shard that does not own it.
    #[error("DBK_ERR_402: Target {target} is not owned by {shard}")]
    MisroutedTarget { target: Target, shard: ShardId },

    /// The shared idempotency store failed.
    #[error("DBK_ERR_403: Idempotency store error: {0}")]
    IdempotencyStore(String),

    /// Another party holds a live claim on this command. Redeliver later.
    #[error("DBK_ERR_404: Command {0} is in flight elsewhere")]
    CommandInFlight(IdempotencyKey),

    // =================================================================
    // Deal Sink Errors (5xx)
    // =================================================================
    /// The deal sink is permanently closed.
    #[error("DBK_ERR_500: Deal sink closed")]
    SinkClosed,

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("DBK_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("DBK_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid values, missing fields, etc.).
    #[error("DBK_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// I/O error (disk, pipes).
    #[error("DBK_ERR_903: I/O error: {0}")]
    Io(String),
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, DealbookError>;

impl From<std::io::Error> for DealbookError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DealbookError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// =====================================================================
// Rejections
// =====================================================================

/// Why a command was refused without touching any book.
///
/// Every kind is a validation failure; the kind narrows down the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// Non-positive price or amount, or an empty identifier.
    Validation,
    /// The target is not registered with the engine.
    UnknownTarget,
    /// Cancel / update of an order owned by another user.
    NotOwner,
    /// `UpdateBuy` against a sell order or vice versa.
    SideMismatch,
    /// An update may not move an order to a different target.
    TargetMismatch,
    /// The request id is already the id of a resting order.
    DuplicateOrder,
}

impl std::fmt::Display for RejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "VALIDATION",
            Self::UnknownTarget => "UNKNOWN_TARGET",
            Self::NotOwner => "NOT_OWNER",
            Self::SideMismatch => "SIDE_MISMATCH",
            Self::TargetMismatch => "TARGET_MISMATCH",
            Self::DuplicateOrder => "DUPLICATE_ORDER",
        };
        f.write_str(s)
    }
}

/// A recorded, serializable command rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectKind,
    pub reason: String,
}

impl Rejection {
    #[must_use]
    pub fn new(kind: RejectKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(RejectKind::Validation, reason)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}
