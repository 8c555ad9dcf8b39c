//! Integration test: deal delivery through an unreliable sink
//!
//! Every command's deals reach the sink exactly once, in command order,
//! before the command is acknowledged, even when the sink keeps refusing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dealbook_engine::*;
use dealbook_types::*;

/// Refuses every `period`-th publish attempt.
struct Unreliable {
    period: u32,
    attempts: AtomicU32,
    accepted: Mutex<Vec<DealBatch>>,
}

impl Unreliable {
    fn new(period: u32) -> Self {
        Self {
            period,
            attempts: AtomicU32::new(0),
            accepted: Mutex::new(Vec::new()),
        }
    }
}

impl DealSink for Unreliable {
    async fn publish(&self, batch: &DealBatch) -> std::result::Result<(), SinkError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt % self.period != 0 {
            return Err(SinkError::Unavailable(format!("attempt {attempt} refused")));
        }
        self.accepted.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        shard_count: 2,
        snapshot_every: 0,
        sink_retry: RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn every_batch_delivered_once_in_order() {
    let sink = Arc::new(Unreliable::new(3));
    let mut engine = Engine::start(
        config(),
        Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(300))),
        Arc::new(MemorySnapshotStore::new()),
        Arc::clone(&sink),
    )
    .await
    .unwrap();

    let mut expected = Vec::new();
    for i in 0..10 {
        engine
            .submit(Command::place(Side::Sell, format!("s-{i}"), "alice", "AAPL", 2, 100 + i))
            .await
            .unwrap();
        let receipt = engine
            .submit(Command::place(Side::Buy, format!("b-{i}"), "bob", "AAPL", 2, 100 + i))
            .await
            .unwrap();
        assert_eq!(receipt.deals().len(), 1);
        // Acknowledged only after the sink took the batch.
        assert_eq!(sink.accepted.lock().unwrap().len(), expected.len() + 1);
        expected.push(receipt.deals().to_vec());
    }

    let delivered: Vec<Vec<Deal>> = sink
        .accepted
        .lock()
        .unwrap()
        .iter()
        .map(|b| b.deals.clone())
        .collect();
    assert_eq!(delivered, expected);
    assert!(sink.attempts.load(Ordering::SeqCst) >= 30);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn redelivered_command_does_not_republish() {
    let sink = Arc::new(Unreliable::new(1));
    let mut engine = Engine::start(
        config(),
        Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(300))),
        Arc::new(MemorySnapshotStore::new()),
        Arc::clone(&sink),
    )
    .await
    .unwrap();

    engine
        .submit(Command::place(Side::Sell, "s-1", "alice", "AAPL", 5, 100))
        .await
        .unwrap();
    let buy = Command::place(Side::Buy, "b-1", "bob", "AAPL", 5, 100);
    engine.submit(buy.clone()).await.unwrap();
    let replay = engine.submit(buy).await.unwrap();

    assert!(replay.replayed);
    assert_eq!(replay.deals().len(), 1);
    assert_eq!(sink.accepted.lock().unwrap().len(), 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn dispatch_pipelines_across_shards() {
    let (sink, mut deals) = ChannelSink::channel(64);
    let mut engine = Engine::start(
        EngineConfig {
            shard_count: 4,
            ..config()
        },
        Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(300))),
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(sink),
    )
    .await
    .unwrap();

    let symbols = ["AAPL", "MSFT", "TSLA", "NVDA", "AMZN", "META"];
    let mut pending = Vec::new();
    for symbol in symbols {
        pending.push(
            engine
                .dispatch(Command::place(Side::Sell, format!("s-{symbol}"), "alice", symbol, 1, 10))
                .await
                .unwrap(),
        );
        pending.push(
            engine
                .dispatch(Command::place(Side::Buy, format!("b-{symbol}"), "bob", symbol, 1, 10))
                .await
                .unwrap(),
        );
    }
    for p in pending {
        p.wait().await.unwrap();
    }

    let mut traded = Vec::new();
    while let Ok(batch) = deals.try_recv() {
        assert_eq!(batch.len(), 1);
        traded.push(batch.target);
    }
    traded.sort();
    let mut want: Vec<Target> = symbols.iter().map(|s| Target::new(*s)).collect();
    want.sort();
    assert_eq!(traded, want);
    engine.shutdown().await.unwrap();
}
