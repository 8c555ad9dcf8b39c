//! # dealbook-dealer
//!
//! Runs the sharded engine behind a JSON-lines transport: commands are read
//! from stdin, receipts and deal batches are written to stdout, logs go to
//! stderr. Snapshots are kept under `DEALBOOK_SNAPSHOT_DIR`.
//!
//! The dealer stops on end of input or Ctrl-C: the in-flight command
//! finishes, every shard writes a final snapshot, and the output is
//! flushed.

mod config;
mod logging;
mod wire;

use std::process::ExitCode;
use std::sync::Arc;

use dealbook_engine::{Engine, FileSnapshotStore, MemoryIdempotencyStore};
use dealbook_types::{DealbookError, constants};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::DealbookConfig;
use crate::wire::{LineSink, Output};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match DealbookConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "dealer stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: DealbookConfig) -> Result<(), DealbookError> {
    tracing::info!(
        engine = constants::ENGINE_NAME,
        version = constants::VERSION,
        shards = config.engine.shard_count,
        snapshot_dir = %config.snapshot_dir.display(),
        "dealer starting"
    );

    let (out_tx, out_rx) = mpsc::channel(config.engine.channel_capacity);
    let writer = tokio::spawn(wire::write_lines(out_rx, tokio::io::stdout()));

    let idempotency = Arc::new(MemoryIdempotencyStore::new(config.engine.claim_ttl()));
    let snapshots = Arc::new(FileSnapshotStore::new(
        &config.snapshot_dir,
        config.engine.snapshots_to_keep,
    ));
    let sink = Arc::new(LineSink::new(out_tx.clone()));
    let mut engine = Engine::start(config.engine.clone(), idempotency, snapshots, sink).await?;

    let served = serve(&mut engine, &out_tx).await;
    let stopped = engine.shutdown().await;

    drop(out_tx);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "output writer failed"),
        Err(err) => tracing::error!(error = %err, "output writer panicked"),
    }
    served.and(stopped)
}

/// Feed stdin lines to the engine until end of input or Ctrl-C.
async fn serve(engine: &mut Engine, out: &mpsc::Sender<Output>) -> Result<(), DealbookError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no: u64 = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                return Ok(());
            }
        };
        let Some(line) = line else {
            tracing::info!(lines = line_no, "end of input, shutting down");
            return Ok(());
        };
        line_no += 1;

        let command = match wire::parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "unreadable command");
                emit(out, Output::Error {
                    line: line_no,
                    error: err.to_string(),
                })
                .await?;
                continue;
            }
        };

        match engine.submit(command).await {
            Ok(receipt) => emit(out, Output::Receipt(receipt)).await?,
            Err(err @ (DealbookError::ShardUnavailable(_) | DealbookError::SinkClosed)) => {
                return Err(err);
            }
            Err(err) => {
                tracing::error!(line = line_no, error = %err, "command failed");
                emit(out, Output::Error {
                    line: line_no,
                    error: err.to_string(),
                })
                .await?;
            }
        }
    }
}

async fn emit(out: &mpsc::Sender<Output>, output: Output) -> Result<(), DealbookError> {
    out.send(output).await.map_err(|_| DealbookError::SinkClosed)
}
