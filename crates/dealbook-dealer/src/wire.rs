//! Newline-delimited JSON transport.
//!
//! Each input line is one serde-encoded [`Command`]. Each output line is an
//! [`Output`]: a deal batch, a receipt, or a line that could not be handled.

use dealbook_engine::{DealSink, SinkError};
use dealbook_types::{Command, DealBatch, Receipt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// One line of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output {
    Deals(DealBatch),
    Receipt(Receipt),
    Error { line: u64, error: String },
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> serde_json::Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Sink publishing deal batches as output lines.
#[derive(Debug, Clone)]
pub struct LineSink {
    tx: mpsc::Sender<Output>,
}

impl LineSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Output>) -> Self {
        Self { tx }
    }
}

impl DealSink for LineSink {
    async fn publish(&self, batch: &DealBatch) -> Result<(), SinkError> {
        self.tx
            .send(Output::Deals(batch.clone()))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Write every output as a JSON line until all senders are dropped.
pub async fn write_lines<W>(mut rx: mpsc::Receiver<Output>, mut out: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(output) = rx.recv().await {
        let mut line = serde_json::to_vec(&output)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use dealbook_types::{RequestId, Side, Target, UserId};

    use super::*;

    #[test]
    fn parses_tagged_commands() {
        let line = r#"{"type":"place_buy","request_id":"r-1","user_id":"bob","target":"AAPL","amount":3,"price":101,"issued_at":"1970-01-01T00:00:00Z"}"#;
        let command = parse_line(line).unwrap().unwrap();
        assert_eq!(
            command,
            Command::place(Side::Buy, "r-1", "bob", "AAPL", 3, 101)
                .with_issued_at(DateTime::<Utc>::UNIX_EPOCH)
        );

        let cancel = parse_line(r#"{"type":"cancel","request_id":"r-2","user_id":"bob","original_request_id":"r-1","issued_at":"1970-01-01T00:00:00Z"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(cancel.original_request_id(), Some(&RequestId::new("r-1")));
        assert_eq!(cancel.user_id(), &UserId::new("bob"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_line("{\"type\":\"teleport\"}").is_err());
        assert!(parse_line("not json").is_err());
        // No issued_at: the command cannot be re-applied deterministically.
        assert!(parse_line(r#"{"type":"cancel","request_id":"r-2","user_id":"bob","original_request_id":"r-1"}"#).is_err());
    }

    #[tokio::test]
    async fn sink_and_writer_emit_json_lines() {
        let (tx, rx) = mpsc::channel(4);
        let sink = LineSink::new(tx.clone());
        let batch = DealBatch {
            shard: dealbook_types::ShardId(1),
            target: Target::new("AAPL"),
            command_sequence: 3,
            deals: Vec::new(),
        };
        sink.publish(&batch).await.unwrap();
        tx.send(Output::Error {
            line: 7,
            error: "bad".into(),
        })
        .await
        .unwrap();
        drop(sink);
        drop(tx);

        let mut buf = Vec::new();
        write_lines(rx, &mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Output = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, Output::Deals(batch));
        assert!(lines[1].contains("\"kind\":\"error\""));
    }
}
