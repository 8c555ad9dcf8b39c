//! The engine shard: single writer for the books of the targets it owns.
//!
//! [`Shard`] is a synchronous state machine. The async loop in
//! [`crate::runtime`] feeds it one command at a time and publishes the
//! deals it returns; nothing else touches its books.
//!
//! ```text
//! Restoring --restore--> Ready --apply--> Applying --> Ready
//!                          \                              |
//!                           +------------stop-------------+--> Stopped
//! ```
//!
//! Every command is answered with a [`Receipt`]. Before a command is
//! applied its idempotency key is looked up in the shard's ledger and then
//! claimed in the shared store; a command seen before is answered with the
//! recorded receipt instead of being applied again.
//!
//! Each restore starts a new epoch. Receipts name the epoch that issued
//! them, and every book remembers which epoch applied which range of its
//! command sequences. A stored receipt whose sequence the restored book
//! hands to a different epoch describes work lost in a crash; that command
//! is applied again.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealbook_matchcore::{BookDepth, OrderBook, match_order};
use dealbook_types::constants::SNAPSHOT_VERSION;
use dealbook_types::{
    CancelOrder, Command, DealbookError, EngineConfig, EpochId, Outcome, PlaceOrder, Receipt,
    RejectKind, Rejection, RequestId, Result, ShardId, Side, Target, UpdateOrder,
};

use crate::idempotency::{IdempotencyStore, ReceiptLedger};
use crate::router::shard_for;
use crate::snapshot::{EpochStart, ShardSnapshot, SnapshotBody, TargetSnapshot};

/// Lifecycle of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Restoring,
    Ready,
    Applying,
    Stopped,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restoring => write!(f, "RESTORING"),
            Self::Ready => write!(f, "READY"),
            Self::Applying => write!(f, "APPLYING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Hand command sequences from `first` on to `epoch`. An earlier epoch
/// that applied nothing to the book is dropped.
fn begin_epoch(starts: &mut Vec<EpochStart>, epoch: EpochId, first: u64) {
    if starts
        .last()
        .is_some_and(|start| start.first_command_sequence == first)
    {
        starts.pop();
    }
    starts.push(EpochStart {
        epoch,
        first_command_sequence: first,
    });
}

/// What applying one command did, before it is wrapped in a receipt.
struct Applied {
    target: Option<Target>,
    command_sequence: u64,
    outcome: Outcome,
}

impl Applied {
    fn rejected(target: Option<Target>, rejection: Rejection) -> Self {
        Self {
            target,
            command_sequence: 0,
            outcome: Outcome::Rejected(rejection),
        }
    }

    fn not_found(order_id: &RequestId) -> Self {
        Self {
            target: None,
            command_sequence: 0,
            outcome: Outcome::NotFound {
                order_id: order_id.clone(),
            },
        }
    }
}

/// Single-writer owner of a set of order books.
pub struct Shard {
    id: ShardId,
    config: EngineConfig,
    state: ShardState,
    epoch: EpochId,
    books: BTreeMap<Target, OrderBook>,
    /// Per book, the epochs that applied its commands, oldest first.
    epochs: BTreeMap<Target, Vec<EpochStart>>,
    ledger: ReceiptLedger,
    store: Arc<dyn IdempotencyStore>,
    /// Commands applied since the shard was first started.
    applied: u64,
}

impl Shard {
    /// A new shard in the `Restoring` state.
    #[must_use]
    pub fn new(id: ShardId, config: &EngineConfig, store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            id,
            config: config.clone(),
            state: ShardState::Restoring,
            epoch: EpochId::generate(),
            books: BTreeMap::new(),
            epochs: BTreeMap::new(),
            ledger: ReceiptLedger::new(config.idempotency_capacity),
            store,
            applied: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> ShardId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ShardState {
        self.state
    }

    #[must_use]
    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied
    }

    #[must_use]
    pub fn book(&self, target: &Target) -> Option<&OrderBook> {
        self.books.get(target)
    }

    pub fn books(&self) -> impl Iterator<Item = &OrderBook> {
        self.books.values()
    }

    #[must_use]
    pub fn depth(&self, target: &Target, levels: usize) -> Option<BookDepth> {
        self.books.get(target).map(|book| book.depth(levels))
    }

    #[must_use]
    pub fn ledger(&self) -> &ReceiptLedger {
        &self.ledger
    }

    // =================================================================
    // Restore / snapshot
    // =================================================================

    /// Rebuild state from `snapshot` (or start empty) and become ready.
    ///
    /// The restored receipts are written back to the shared store, so
    /// commands applied before the snapshot are recognised after restart
    /// even if the store lost them.
    pub fn restore(&mut self, snapshot: Option<&ShardSnapshot>) -> Result<()> {
        if self.state != ShardState::Restoring {
            return Err(DealbookError::ShardNotReady {
                shard: self.id,
                state: self.state.to_string(),
            });
        }

        if let Some(snapshot) = snapshot {
            snapshot.validate(self.id, self.config.shard_count)?;
            self.books = snapshot.rebuild_books()?;
            self.epochs = snapshot
                .body
                .targets
                .iter()
                .map(|ts| (ts.target.clone(), ts.epochs.clone()))
                .collect();
            self.ledger.restore(snapshot.body.receipts.clone());
            self.applied = snapshot.body.sequence;

            for receipt in self.ledger.iter() {
                self.store.record(&receipt.key, receipt)?;
            }
        }

        for (target, book) in &self.books {
            let starts = self.epochs.entry(target.clone()).or_default();
            begin_epoch(starts, self.epoch, book.last_command_sequence() + 1);
        }

        self.state = ShardState::Ready;
        tracing::info!(
            shard = %self.id,
            epoch = %self.epoch,
            targets = self.books.len(),
            orders = self.books.values().map(OrderBook::order_count).sum::<usize>(),
            receipts = self.ledger.len(),
            applied = self.applied,
            "shard restored"
        );
        Ok(())
    }

    /// Decode `blob` and restore from it.
    pub fn restore_blob(&mut self, blob: Option<&[u8]>) -> Result<()> {
        let snapshot = blob.map(ShardSnapshot::decode).transpose()?;
        self.restore(snapshot.as_ref())
    }

    /// Capture every book, the counters and the receipt ledger.
    pub fn snapshot(&self, taken_at: DateTime<Utc>) -> Result<ShardSnapshot> {
        ShardSnapshot::seal(SnapshotBody {
            version: SNAPSHOT_VERSION,
            shard_id: self.id,
            shard_count: self.config.shard_count,
            sequence: self.applied,
            taken_at,
            targets: self
                .books
                .values()
                .map(|book| {
                    let starts = self.epochs.get(book.target()).map_or(&[][..], Vec::as_slice);
                    TargetSnapshot::capture(book, starts)
                })
                .collect(),
            receipts: self.ledger.iter().cloned().collect(),
        })
    }

    pub fn stop(&mut self) {
        self.state = ShardState::Stopped;
        tracing::info!(shard = %self.id, applied = self.applied, "shard stopped");
    }

    // =================================================================
    // Apply
    // =================================================================

    /// Apply one command and return its receipt.
    ///
    /// Business failures are recorded in the receipt; an `Err` means the
    /// shard itself could not process the command.
    pub fn apply(&mut self, command: &Command) -> Result<Receipt> {
        match self.state {
            ShardState::Ready => {}
            ShardState::Stopped => return Err(DealbookError::ShardUnavailable(self.id)),
            other => {
                return Err(DealbookError::ShardNotReady {
                    shard: self.id,
                    state: other.to_string(),
                });
            }
        }

        let key = command.key();
        if let Some(prior) = self.ledger.get(&key) {
            tracing::debug!(shard = %self.id, key = %key, "redelivered command answered from ledger");
            return Ok(prior.clone().into_replay());
        }

        let claim = self.store.try_claim(&key)?;
        if !claim.first_claim {
            let Some(prior) = claim.prior_result else {
                // Live claim without a result: someone else is applying it.
                tracing::warn!(shard = %self.id, key = %key, "command in flight elsewhere");
                return Err(DealbookError::CommandInFlight(key));
            };
            if !self.is_lost(&prior) {
                tracing::debug!(shard = %self.id, key = %key, "redelivered command answered from store");
                self.ledger.record(prior.clone());
                return Ok(prior.into_replay());
            }
            tracing::warn!(
                shard = %self.id,
                key = %key,
                lost_epoch = %prior.epoch,
                command_sequence = prior.command_sequence,
                "stored receipt was lost with its epoch, re-applying"
            );
        }

        self.state = ShardState::Applying;
        let applied = self.execute(command);
        self.state = ShardState::Ready;

        let applied = match applied {
            Ok(applied) => applied,
            Err(err) => {
                if let Err(release_err) = self.store.release(&key) {
                    tracing::warn!(shard = %self.id, key = %key, error = %release_err, "failed to release claim");
                }
                return Err(err);
            }
        };

        let receipt = Receipt {
            key: key.clone(),
            command: command.name().to_string(),
            shard: self.id,
            epoch: self.epoch,
            target: applied.target,
            command_sequence: applied.command_sequence,
            outcome: applied.outcome,
            replayed: false,
        };

        self.applied += 1;
        self.ledger.record(receipt.clone());
        if let Err(err) = self.store.record(&key, &receipt) {
            // The ledger still answers redeliveries to this shard.
            tracing::warn!(shard = %self.id, key = %key, error = %err, "failed to record receipt");
        }

        tracing::debug!(
            shard = %self.id,
            key = %key,
            command = command.name(),
            outcome = receipt.outcome.name(),
            deals = receipt.deals().len(),
            command_sequence = receipt.command_sequence,
            "command applied"
        );
        Ok(receipt)
    }

    /// A stored receipt describes a mutation this shard no longer has: the
    /// restored book gives its command sequence to another epoch, or the
    /// book was never snapshotted at all. Receipts that changed nothing,
    /// and receipts issued by other shards, are taken as they are.
    fn is_lost(&self, prior: &Receipt) -> bool {
        if prior.command_sequence == 0 || prior.shard != self.id {
            return false;
        }
        let Some(starts) = prior.target.as_ref().and_then(|t| self.epochs.get(t)) else {
            return true;
        };
        starts
            .iter()
            .rev()
            .find(|start| start.first_command_sequence <= prior.command_sequence)
            .is_some_and(|owner| owner.epoch != prior.epoch)
    }

    fn execute(&mut self, command: &Command) -> Result<Applied> {
        if let Err(rejection) = command.validate() {
            return Ok(Applied::rejected(command.target().cloned(), rejection));
        }
        match command {
            Command::PlaceBuy(place) => self.place(command, place, Side::Buy),
            Command::PlaceSell(place) => self.place(command, place, Side::Sell),
            Command::Cancel(cancel) => self.cancel(cancel),
            Command::UpdateBuy(update) => self.update(command, update, Side::Buy),
            Command::UpdateSell(update) => self.update(command, update, Side::Sell),
        }
    }

    /// Target of the book currently holding `order_id`.
    fn locate(&self, order_id: &RequestId) -> Option<Target> {
        self.books
            .iter()
            .find(|(_, book)| book.contains_order(order_id))
            .map(|(target, _)| target.clone())
    }

    fn place(&mut self, command: &Command, place: &PlaceOrder, side: Side) -> Result<Applied> {
        let target = place.target.clone();
        if shard_for(&target, self.config.shard_count) != self.id {
            return Err(DealbookError::MisroutedTarget {
                target,
                shard: self.id,
            });
        }
        if !self.config.accepts(&target) {
            return Ok(Applied::rejected(
                Some(target.clone()),
                Rejection::new(RejectKind::UnknownTarget, format!("target {target} is not registered")),
            ));
        }
        if self.locate(&place.request_id).is_some() {
            return Ok(Applied::rejected(
                Some(target),
                Rejection::new(
                    RejectKind::DuplicateOrder,
                    format!("order {} is already resting", place.request_id),
                ),
            ));
        }

        let order = command
            .new_order()
            .ok_or_else(|| DealbookError::Internal(format!("{} carries no order", command.name())))?;
        debug_assert_eq!(order.side, side);

        let epoch = self.epoch;
        self.epochs.entry(target.clone()).or_insert_with(|| {
            vec![EpochStart {
                epoch,
                first_command_sequence: 1,
            }]
        });
        let book = self
            .books
            .entry(target.clone())
            .or_insert_with(|| OrderBook::new(target.clone()));
        let matched = match_order(book, order)?;
        let command_sequence = book.next_command_sequence();

        Ok(Applied {
            target: Some(target),
            command_sequence,
            outcome: Outcome::Placed {
                order: matched.order,
                deals: matched.deals,
            },
        })
    }

    fn cancel(&mut self, cancel: &CancelOrder) -> Result<Applied> {
        let Some(target) = self.locate(&cancel.original_request_id) else {
            return Ok(Applied::not_found(&cancel.original_request_id));
        };
        let book = self
            .books
            .get_mut(&target)
            .ok_or_else(|| DealbookError::OrderNotFound(cancel.original_request_id.clone()))?;

        let owner = book
            .get(&cancel.original_request_id)
            .map(|o| o.user_id.clone())
            .ok_or_else(|| DealbookError::OrderNotFound(cancel.original_request_id.clone()))?;
        if owner != cancel.user_id {
            return Ok(Applied::rejected(
                Some(target),
                Rejection::new(
                    RejectKind::NotOwner,
                    format!("order {} belongs to another user", cancel.original_request_id),
                ),
            ));
        }

        let mut order = book.remove(&cancel.original_request_id)?;
        order.cancel();
        let command_sequence = book.next_command_sequence();
        Ok(Applied {
            target: Some(target),
            command_sequence,
            outcome: Outcome::Cancelled { order },
        })
    }

    /// Cancel-and-replace. Every precondition is checked before the
    /// original order is touched.
    fn update(&mut self, command: &Command, update: &UpdateOrder, side: Side) -> Result<Applied> {
        if !self.config.accepts(&update.target) {
            return Ok(Applied::rejected(
                Some(update.target.clone()),
                Rejection::new(
                    RejectKind::UnknownTarget,
                    format!("target {} is not registered", update.target),
                ),
            ));
        }
        let Some(target) = self.locate(&update.original_request_id) else {
            return Ok(Applied::not_found(&update.original_request_id));
        };
        if target != update.target {
            let reason = format!(
                "order {} is on {}, update names {}",
                update.original_request_id, target, update.target
            );
            return Ok(Applied::rejected(
                Some(target),
                Rejection::new(RejectKind::TargetMismatch, reason),
            ));
        }
        if self.locate(&update.request_id).is_some() {
            return Ok(Applied::rejected(
                Some(target),
                Rejection::new(
                    RejectKind::DuplicateOrder,
                    format!("order {} is already resting", update.request_id),
                ),
            ));
        }

        let replacement = command
            .new_order()
            .ok_or_else(|| DealbookError::Internal(format!("{} carries no order", command.name())))?;

        let book = self
            .books
            .get_mut(&target)
            .ok_or_else(|| DealbookError::OrderNotFound(update.original_request_id.clone()))?;

        let original = book
            .get(&update.original_request_id)
            .ok_or_else(|| DealbookError::OrderNotFound(update.original_request_id.clone()))?;
        let rejection = if original.user_id != update.user_id {
            Some(Rejection::new(
                RejectKind::NotOwner,
                format!("order {} belongs to another user", update.original_request_id),
            ))
        } else if original.side != side {
            Some(Rejection::new(
                RejectKind::SideMismatch,
                format!(
                    "order {} is a {} order, update is {}",
                    update.original_request_id, original.side, side
                ),
            ))
        } else {
            None
        };
        if let Some(rejection) = rejection {
            return Ok(Applied::rejected(Some(target), rejection));
        }

        let removed = book.remove(&update.original_request_id)?;
        let matched = match match_order(book, replacement) {
            Ok(matched) => matched,
            Err(err) => {
                book.insert(removed)?;
                return Err(err);
            }
        };
        let mut cancelled = removed;
        cancelled.cancel();
        let command_sequence = book.next_command_sequence();

        Ok(Applied {
            target: Some(target),
            command_sequence,
            outcome: Outcome::Replaced {
                cancelled,
                order: matched.order,
                deals: matched.deals,
            },
        })
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("targets", &self.books.len())
            .field("receipts", &self.ledger.len())
            .field("applied", &self.applied)
            .finish_non_exhaustive()
    }
}
