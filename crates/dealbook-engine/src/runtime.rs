//! Async driver for a [`Shard`].
//!
//! Each shard runs in its own tokio task and owns its books outright. It
//! receives [`ShardMessage`]s over a bounded channel and handles them one
//! at a time: a command is applied, its deals are delivered to the sink,
//! and only then is the caller answered and the next message received.
//!
//! When every sender is dropped the task takes a final snapshot and stops.
//! If the sink closes for good the task stops *without* a snapshot, so a
//! restart replays the commands whose deals were never delivered.

use std::sync::Arc;

use chrono::Utc;
use dealbook_matchcore::BookDepth;
use dealbook_types::{
    Command, DealBatch, DealbookError, EngineConfig, Receipt, Result, ShardId, Target,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::shard::Shard;
use crate::sink::{DealSink, publish_with_retry};
use crate::snapshot::SnapshotStore;

/// Request handled by a shard task.
#[derive(Debug)]
pub enum ShardMessage {
    Apply {
        command: Command,
        reply: oneshot::Sender<Result<Receipt>>,
    },
    /// Take and store a snapshot now; answers with its sequence.
    Snapshot { reply: oneshot::Sender<Result<u64>> },
    Depth {
        target: Target,
        levels: usize,
        reply: oneshot::Sender<Option<BookDepth>>,
    },
}

/// Owner's side of a running shard task.
#[derive(Debug)]
pub struct ShardHandle {
    id: ShardId,
    tx: mpsc::Sender<ShardMessage>,
    join: JoinHandle<Result<()>>,
}

impl ShardHandle {
    #[must_use]
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Queue `message`, waiting while the channel is full.
    pub async fn send(&self, message: ShardMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| DealbookError::ShardUnavailable(self.id))
    }

    /// Close the channel and wait for the task to finish.
    pub async fn join(self) -> Result<()> {
        let Self { id, tx, join } = self;
        drop(tx);
        join.await
            .map_err(|e| DealbookError::Internal(format!("{id} task failed: {e}")))?
    }
}

/// Collaborators a shard task needs besides its shard.
pub struct ShardContext<S> {
    pub config: EngineConfig,
    pub sink: Arc<S>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

/// Spawn the task driving `shard`. The shard must already be restored.
pub fn spawn<S: DealSink>(shard: Shard, ctx: ShardContext<S>) -> ShardHandle {
    let id = shard.id();
    let (tx, rx) = mpsc::channel(ctx.config.channel_capacity);
    let join = tokio::spawn(run(shard, rx, ctx));
    ShardHandle { id, tx, join }
}

async fn run<S: DealSink>(
    mut shard: Shard,
    mut rx: mpsc::Receiver<ShardMessage>,
    ctx: ShardContext<S>,
) -> Result<()> {
    tracing::info!(shard = %shard.id(), "shard task started");

    while let Some(message) = rx.recv().await {
        match message {
            ShardMessage::Apply { command, reply } => {
                let result = apply(&mut shard, &command, &ctx).await;
                let sink_closed = matches!(result, Err(DealbookError::SinkClosed));
                let fresh = matches!(&result, Ok(receipt) if !receipt.replayed);
                // The caller may have stopped waiting.
                let _ = reply.send(result);

                if sink_closed {
                    shard.stop();
                    return Err(DealbookError::SinkClosed);
                }
                if fresh && is_snapshot_due(&ctx.config, shard.applied()) {
                    if let Err(err) = save_snapshot(&shard, &ctx).await {
                        tracing::warn!(shard = %shard.id(), error = %err, "periodic snapshot failed");
                    }
                }
            }
            ShardMessage::Snapshot { reply } => {
                let _ = reply.send(save_snapshot(&shard, &ctx).await);
            }
            ShardMessage::Depth {
                target,
                levels,
                reply,
            } => {
                let _ = reply.send(shard.depth(&target, levels));
            }
        }
    }

    let result = save_snapshot(&shard, &ctx).await;
    shard.stop();
    result.map(|_| ())
}

/// Apply `command` and deliver its deals before answering.
async fn apply<S: DealSink>(
    shard: &mut Shard,
    command: &Command,
    ctx: &ShardContext<S>,
) -> Result<Receipt> {
    let receipt = shard.apply(command)?;
    if receipt.replayed || receipt.deals().is_empty() {
        return Ok(receipt);
    }
    let Some(target) = receipt.target.clone() else {
        return Ok(receipt);
    };

    let batch = DealBatch {
        shard: shard.id(),
        target,
        command_sequence: receipt.command_sequence,
        deals: receipt.deals().to_vec(),
    };
    publish_with_retry(ctx.sink.as_ref(), shard.id(), &batch, &ctx.config.sink_retry).await?;
    Ok(receipt)
}

fn is_snapshot_due(config: &EngineConfig, applied: u64) -> bool {
    config.snapshot_every > 0 && applied > 0 && applied % config.snapshot_every == 0
}

async fn save_snapshot<S>(shard: &Shard, ctx: &ShardContext<S>) -> Result<u64> {
    let snapshot = shard.snapshot(Utc::now())?;
    let sequence = snapshot.body.sequence;
    let blob = snapshot.encode()?;
    let store = Arc::clone(&ctx.snapshots);
    let id = shard.id();

    tokio::task::spawn_blocking(move || store.save(id, sequence, &blob))
        .await
        .map_err(|e| DealbookError::Internal(format!("snapshot task failed: {e}")))??;

    tracing::info!(shard = %id, sequence, "snapshot saved");
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dealbook_types::{Side, constants};

    use super::*;
    use crate::idempotency::MemoryIdempotencyStore;
    use crate::sink::ChannelSink;
    use crate::snapshot::{MemorySnapshotStore, ShardSnapshot};

    fn config() -> EngineConfig {
        EngineConfig {
            shard_count: 1,
            snapshot_every: 2,
            ..EngineConfig::default()
        }
    }

    fn start(
        config: &EngineConfig,
        snapshots: Arc<MemorySnapshotStore>,
    ) -> (ShardHandle, mpsc::Receiver<DealBatch>) {
        let store = Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(300)));
        let mut shard = Shard::new(ShardId(0), config, store);
        shard.restore(None).unwrap();
        let (sink, deals) = ChannelSink::channel(16);
        let ctx = ShardContext {
            config: config.clone(),
            sink: Arc::new(sink),
            snapshots,
        };
        (spawn(shard, ctx), deals)
    }

    async fn apply(handle: &ShardHandle, command: Command) -> Result<Receipt> {
        let (reply, rx) = oneshot::channel();
        handle.send(ShardMessage::Apply { command, reply }).await?;
        rx.await
            .unwrap_or(Err(DealbookError::ShardUnavailable(handle.id())))
    }

    #[tokio::test]
    async fn deals_are_published_before_the_reply() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let (handle, mut deals) = start(&config(), snapshots);

        apply(&handle, Command::place(Side::Sell, "s-1", "alice", "X", 5, 100))
            .await
            .unwrap();
        let receipt = apply(&handle, Command::place(Side::Buy, "b-1", "bob", "X", 3, 100))
            .await
            .unwrap();

        let batch = deals.try_recv().expect("batch delivered before reply");
        assert_eq!(batch.deals, receipt.deals());
        assert_eq!(batch.command_sequence, receipt.command_sequence);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn replays_publish_nothing() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let (handle, mut deals) = start(&config(), snapshots);
        apply(&handle, Command::place(Side::Sell, "s-1", "alice", "X", 5, 100))
            .await
            .unwrap();
        let buy = Command::place(Side::Buy, "b-1", "bob", "X", 3, 100);
        apply(&handle, buy.clone()).await.unwrap();
        let replay = apply(&handle, buy).await.unwrap();

        assert!(replay.replayed);
        assert!(deals.try_recv().is_ok());
        assert!(deals.try_recv().is_err(), "replay must not publish again");
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn periodic_and_final_snapshots() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let (handle, _deals) = start(&config(), snapshots.clone());

        for i in 0..3 {
            apply(&handle, Command::place(Side::Buy, format!("b-{i}"), "bob", "X", 1, 10 + i))
                .await
                .unwrap();
        }
        assert_eq!(snapshots.latest_sequence(ShardId(0)), Some(2));

        handle.join().await.unwrap();
        assert_eq!(snapshots.latest_sequence(ShardId(0)), Some(3));

        let blob = snapshots.load_latest(ShardId(0)).unwrap().unwrap();
        let snapshot = ShardSnapshot::decode(&blob).unwrap();
        assert_eq!(snapshot.body.version, constants::SNAPSHOT_VERSION);
        assert_eq!(snapshot.body.targets[0].orders.len(), 3);
    }

    #[tokio::test]
    async fn closed_sink_stops_without_snapshot() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let (handle, deals) = start(&config(), snapshots.clone());
        drop(deals);

        apply(&handle, Command::place(Side::Sell, "s-1", "alice", "X", 5, 100))
            .await
            .unwrap();
        let err = apply(&handle, Command::place(Side::Buy, "b-1", "bob", "X", 3, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, DealbookError::SinkClosed));

        let after = apply(&handle, Command::place(Side::Buy, "b-2", "bob", "X", 1, 1)).await;
        assert!(matches!(after, Err(DealbookError::ShardUnavailable(_))));
        assert!(matches!(handle.join().await, Err(DealbookError::SinkClosed)));
        assert_eq!(snapshots.latest_sequence(ShardId(0)), None);
    }

    #[tokio::test]
    async fn depth_is_read_through_the_task() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let (handle, _deals) = start(&config(), snapshots);
        apply(&handle, Command::place(Side::Buy, "b-1", "bob", "X", 4, 99))
            .await
            .unwrap();

        let (reply, rx) = oneshot::channel();
        handle
            .send(ShardMessage::Depth {
                target: Target::new("X"),
                levels: 5,
                reply,
            })
            .await
            .unwrap();
        let depth = rx.await.unwrap().unwrap();
        assert_eq!(depth.bids.len(), 1);
        assert_eq!(depth.bids[0].amount, 4);
        assert!(depth.asks.is_empty());
        handle.join().await.unwrap();
    }
}
