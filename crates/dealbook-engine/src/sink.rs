//! Outbound deal delivery.
//!
//! A shard hands every non-empty [`DealBatch`] to a [`DealSink`] before it
//! acknowledges the command. A sink that is temporarily unavailable is
//! retried with the *same* batch until it accepts it; the match is never
//! run again.

use std::future::Future;

use dealbook_types::{DealBatch, DealbookError, RetryPolicy, ShardId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Why a sink refused a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Try again later.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The sink will never accept another batch.
    #[error("sink closed")]
    Closed,
}

/// Destination of the deal stream.
pub trait DealSink: Send + Sync + 'static {
    /// Deliver `batch`. Returning `Ok` means the batch is durable on the
    /// sink's side and will not be asked for again.
    fn publish(&self, batch: &DealBatch) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Sink backed by a bounded tokio channel. A full channel applies
/// backpressure to the shard; a dropped receiver closes the sink.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DealBatch>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<DealBatch>) -> Self {
        Self { tx }
    }

    /// A sink and the receiving end of its channel.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DealBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl DealSink for ChannelSink {
    async fn publish(&self, batch: &DealBatch) -> Result<(), SinkError> {
        self.tx
            .send(batch.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Publish `batch`, retrying with backoff until the sink accepts it.
///
/// Returns [`DealbookError::SinkClosed`] only when the sink is closed for
/// good.
pub async fn publish_with_retry<S: DealSink>(
    sink: &S,
    shard: ShardId,
    batch: &DealBatch,
    policy: &RetryPolicy,
) -> Result<(), DealbookError> {
    let mut attempt: u32 = 0;
    loop {
        match sink.publish(batch).await {
            Ok(()) => {
                if attempt > 0 {
                    tracing::info!(
                        shard = %shard,
                        symbol = %batch.target,
                        command_sequence = batch.command_sequence,
                        attempts = attempt + 1,
                        "deal batch delivered after retry"
                    );
                }
                return Ok(());
            }
            Err(SinkError::Closed) => {
                tracing::error!(
                    shard = %shard,
                    symbol = %batch.target,
                    command_sequence = batch.command_sequence,
                    "deal sink closed"
                );
                return Err(DealbookError::SinkClosed);
            }
            Err(SinkError::Unavailable(reason)) => {
                attempt = attempt.saturating_add(1);
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    shard = %shard,
                    symbol = %batch.target,
                    command_sequence = batch.command_sequence,
                    deals = batch.len(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %reason,
                    "deal sink unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use dealbook_types::Target;

    use super::*;

    fn batch() -> DealBatch {
        DealBatch {
            shard: ShardId(0),
            target: Target::new("AAPL"),
            command_sequence: 1,
            deals: Vec::new(),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    /// Refuses the first `failures` publishes.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        delivered: Mutex<Vec<DealBatch>>,
    }

    impl DealSink for Flaky {
        async fn publish(&self, batch: &DealBatch) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SinkError::Unavailable(format!("attempt {call}")));
            }
            self.delivered.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::channel(4);
        sink.publish(&batch()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), batch());
    }

    #[tokio::test]
    async fn dropped_receiver_closes_sink() {
        let (sink, rx) = ChannelSink::channel(4);
        drop(rx);
        assert_eq!(sink.publish(&batch()).await, Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn retry_delivers_same_batch_once() {
        let sink = Flaky {
            failures: 3,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        };
        publish_with_retry(&sink, ShardId(0), &batch(), &fast())
            .await
            .unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
        assert_eq!(*sink.delivered.lock().unwrap(), vec![batch()]);
    }

    #[tokio::test]
    async fn closed_sink_is_fatal() {
        let (sink, rx) = ChannelSink::channel(1);
        drop(rx);
        let err = publish_with_retry(&sink, ShardId(0), &batch(), &fast())
            .await
            .unwrap_err();
        assert!(matches!(err, DealbookError::SinkClosed));
    }
}
