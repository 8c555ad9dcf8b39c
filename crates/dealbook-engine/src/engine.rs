//! The sharded engine.
//!
//! [`Engine::start`] restores every shard from its latest snapshot before
//! any of them accepts a command; one bad snapshot and the engine refuses
//! to start. Commands are then routed to the owning shard and answered
//! with a [`Receipt`].

use std::sync::Arc;

use dealbook_matchcore::BookDepth;
use dealbook_types::{
    Command, DealbookError, EngineConfig, Outcome, Receipt, Result, ShardId, Target,
};
use tokio::sync::oneshot;

use crate::idempotency::IdempotencyStore;
use crate::router::Router;
use crate::runtime::{self, ShardContext, ShardHandle, ShardMessage};
use crate::shard::Shard;
use crate::sink::DealSink;
use crate::snapshot::SnapshotStore;

/// Receipt of a dispatched command, not yet awaited.
#[derive(Debug)]
pub struct PendingReceipt {
    shard: ShardId,
    rx: oneshot::Receiver<Result<Receipt>>,
}

impl PendingReceipt {
    #[must_use]
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub async fn wait(self) -> Result<Receipt> {
        self.rx
            .await
            .map_err(|_| DealbookError::ShardUnavailable(self.shard))?
    }
}

/// A running set of shards behind a router.
pub struct Engine {
    config: EngineConfig,
    router: Router,
    shards: Vec<ShardHandle>,
}

impl Engine {
    /// Restore all shards and start their tasks.
    pub async fn start<S: DealSink>(
        config: EngineConfig,
        idempotency: Arc<dyn IdempotencyStore>,
        snapshots: Arc<dyn SnapshotStore>,
        sink: Arc<S>,
    ) -> Result<Self> {
        config.validate()?;
        let mut router = Router::new(config.shard_count, config.locator_capacity);

        let mut restored = Vec::new();
        for index in 0..config.shard_count {
            let id = ShardId(index);
            let store = Arc::clone(&snapshots);
            let blob = tokio::task::spawn_blocking(move || store.load_latest(id))
                .await
                .map_err(|e| DealbookError::Internal(format!("snapshot load failed: {e}")))??;

            let mut shard = Shard::new(id, &config, Arc::clone(&idempotency));
            if let Err(err) = shard.restore_blob(blob.as_deref()) {
                tracing::error!(shard = %id, error = %err, "shard restore failed");
                return Err(err);
            }
            locate_orders(&mut router, &shard);
            restored.push(shard);
        }

        let shards = restored
            .into_iter()
            .map(|shard| {
                runtime::spawn(
                    shard,
                    ShardContext {
                        config: config.clone(),
                        sink: Arc::clone(&sink),
                        snapshots: Arc::clone(&snapshots),
                    },
                )
            })
            .collect();

        tracing::info!(
            shards = config.shard_count,
            located = router.locator().len(),
            "engine started"
        );
        Ok(Self {
            config,
            router,
            shards,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Route `command` and queue it on its shard.
    ///
    /// Commands dispatched to one shard are applied in dispatch order.
    pub async fn dispatch(&mut self, command: Command) -> Result<PendingReceipt> {
        let shard = self.router.route(&command);
        tracing::debug!(
            shard = %shard,
            key = %command.key(),
            command = command.name(),
            "command dispatched"
        );
        let (reply, rx) = oneshot::channel();
        self.handle(shard)?
            .send(ShardMessage::Apply { command, reply })
            .await?;
        Ok(PendingReceipt { shard, rx })
    }

    /// Dispatch `command` and wait for its receipt.
    pub async fn submit(&mut self, command: Command) -> Result<Receipt> {
        self.dispatch(command).await?.wait().await
    }

    /// Aggregated levels of `target`'s book, read by its shard.
    pub async fn book_view(&self, target: &Target, levels: usize) -> Result<Option<BookDepth>> {
        let shard = self.router.shard_for_target(target);
        let (reply, rx) = oneshot::channel();
        self.handle(shard)?
            .send(ShardMessage::Depth {
                target: target.clone(),
                levels,
                reply,
            })
            .await?;
        rx.await.map_err(|_| DealbookError::ShardUnavailable(shard))
    }

    /// Snapshot every shard now. Returns each shard's snapshot sequence.
    pub async fn snapshot_all(&self) -> Result<Vec<(ShardId, u64)>> {
        let mut taken = Vec::with_capacity(self.shards.len());
        for handle in &self.shards {
            let (reply, rx) = oneshot::channel();
            handle.send(ShardMessage::Snapshot { reply }).await?;
            let sequence = rx
                .await
                .map_err(|_| DealbookError::ShardUnavailable(handle.id()))??;
            taken.push((handle.id(), sequence));
        }
        Ok(taken)
    }

    /// Stop accepting commands, let every shard finish and snapshot.
    ///
    /// All shards are joined; the first failure is returned.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(shards = self.shards.len(), "engine shutting down");
        let mut first_err = None;
        for handle in self.shards {
            let id = handle.id();
            if let Err(err) = handle.join().await {
                tracing::error!(shard = %id, error = %err, "shard stopped with error");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn handle(&self, shard: ShardId) -> Result<&ShardHandle> {
        usize::try_from(shard.0)
            .ok()
            .and_then(|i| self.shards.get(i))
            .ok_or(DealbookError::ShardUnavailable(shard))
    }
}

/// Point the router at every order a restored shard knows about: resting
/// orders and orders named in its receipts.
fn locate_orders(router: &mut Router, shard: &Shard) {
    for receipt in shard.ledger().iter() {
        match &receipt.outcome {
            Outcome::Placed { order, .. } | Outcome::Cancelled { order } => {
                router.remember(order.id.clone(), shard.id());
            }
            Outcome::Replaced {
                cancelled, order, ..
            } => {
                router.remember(cancelled.id.clone(), shard.id());
                router.remember(order.id.clone(), shard.id());
            }
            Outcome::NotFound { .. } | Outcome::Rejected(_) => {}
        }
    }
    for book in shard.books() {
        for order in book.snapshot() {
            router.remember(order.id, shard.id());
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("shards", &self.shards.len())
            .field("located", &self.router.locator().len())
            .finish_non_exhaustive()
    }
}
