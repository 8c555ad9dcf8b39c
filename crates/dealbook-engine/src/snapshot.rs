//! Shard snapshots: format, integrity checks and storage.
//!
//! A snapshot captures every book a shard owns (resting orders plus the
//! order, command and deal counters) and the shard's receipt ledger. It is
//! stored as a JSON blob:
//!
//! - `version` is checked first; unknown versions are refused.
//! - `checksum` is the hex SHA-256 of the serialized body.
//! - the decoded contents are then validated structurally before any book
//!   is rebuilt.
//!
//! Any failure is fatal for the shard: it never becomes ready.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dealbook_matchcore::OrderBook;
use dealbook_types::constants::SNAPSHOT_VERSION;
use dealbook_types::{DealbookError, EpochId, Order, Receipt, RequestId, Result, ShardId, Target};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::router::shard_for;

// ── Format ──────────────────────────────────────────────────────────

/// First command sequence a shard epoch applied to a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochStart {
    pub epoch: EpochId,
    pub first_command_sequence: u64,
}

/// One book inside a shard snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub target: Target,
    /// Resting orders, bids best to worst then asks best to worst.
    pub orders: Vec<Order>,
    pub last_order_sequence: u64,
    pub last_command_sequence: u64,
    pub last_deal_sequence: u64,
    /// Epochs whose commands make up this book, oldest first. Command
    /// sequences from `first_command_sequence` up to the next entry belong
    /// to that epoch.
    #[serde(default)]
    pub epochs: Vec<EpochStart>,
}

impl TargetSnapshot {
    #[must_use]
    pub fn capture(book: &OrderBook, epochs: &[EpochStart]) -> Self {
        Self {
            target: book.target().clone(),
            orders: book.snapshot(),
            last_order_sequence: book.last_order_sequence(),
            last_command_sequence: book.last_command_sequence(),
            last_deal_sequence: book.last_deal_sequence(),
            epochs: epochs.to_vec(),
        }
    }

    /// Rebuild the book this snapshot describes.
    pub fn rebuild(&self) -> Result<OrderBook> {
        let mut book = OrderBook::new(self.target.clone());
        book.restore(self.orders.clone(), self.last_order_sequence)
            .map_err(|e| corrupt(format!("book {}: {e}", self.target)))?;
        book.restore_counters(self.last_command_sequence, self.last_deal_sequence);
        Ok(book)
    }
}

/// Everything covered by the checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBody {
    pub version: u32,
    pub shard_id: ShardId,
    /// Size of the routing table the snapshot was taken under.
    pub shard_count: u32,
    /// Commands applied by the shard since it was first started.
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub targets: Vec<TargetSnapshot>,
    /// Receipt ledger, oldest first.
    pub receipts: Vec<Receipt>,
}

impl SnapshotBody {
    /// Hex SHA-256 over the serialized body.
    pub fn compute_checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// A sealed, checksummed shard snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    #[serde(flatten)]
    pub body: SnapshotBody,
    pub checksum: String,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

fn corrupt(reason: impl Into<String>) -> DealbookError {
    DealbookError::CorruptSnapshot {
        reason: reason.into(),
    }
}

impl ShardSnapshot {
    /// Seal `body` with its checksum.
    pub fn seal(body: SnapshotBody) -> Result<Self> {
        let checksum = body.compute_checksum()?;
        Ok(Self { body, checksum })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a blob, checking version and checksum.
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_slice(blob)
            .map_err(|e| corrupt(format!("unreadable snapshot header: {e}")))?;
        if probe.version != SNAPSHOT_VERSION {
            return Err(DealbookError::UnsupportedSnapshotVersion {
                found: probe.version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let snapshot: Self = serde_json::from_slice(blob)
            .map_err(|e| corrupt(format!("unreadable snapshot body: {e}")))?;
        let actual = snapshot.body.compute_checksum()?;
        if actual != snapshot.checksum {
            return Err(DealbookError::SnapshotIntegrity {
                expected: snapshot.checksum,
                actual,
            });
        }
        Ok(snapshot)
    }

    /// Structural checks that do not need the books rebuilt.
    pub fn validate(&self, shard: ShardId, shard_count: u32) -> Result<()> {
        let body = &self.body;
        if body.shard_id != shard {
            return Err(corrupt(format!(
                "snapshot belongs to {}, not {shard}",
                body.shard_id
            )));
        }
        if body.shard_count != shard_count {
            return Err(corrupt(format!(
                "snapshot taken with {} shards, engine has {shard_count}",
                body.shard_count
            )));
        }

        let mut targets = HashSet::new();
        let mut order_ids: HashSet<&RequestId> = HashSet::new();
        for ts in &body.targets {
            if !targets.insert(&ts.target) {
                return Err(corrupt(format!("target {} appears twice", ts.target)));
            }
            if shard_for(&ts.target, shard_count) != shard {
                return Err(corrupt(format!("target {} is not owned by {shard}", ts.target)));
            }
            if ts.last_deal_sequence > 0 && ts.last_command_sequence == 0 {
                return Err(corrupt(format!(
                    "target {} has deals but no applied commands",
                    ts.target
                )));
            }
            let mut floor = 0;
            for start in &ts.epochs {
                if start.first_command_sequence <= floor
                    || start.first_command_sequence > ts.last_command_sequence + 1
                {
                    return Err(corrupt(format!(
                        "target {} has epoch {} starting at {}",
                        ts.target, start.epoch, start.first_command_sequence
                    )));
                }
                floor = start.first_command_sequence;
            }
            for order in &ts.orders {
                if !order_ids.insert(&order.id) {
                    return Err(corrupt(format!("order {} appears twice", order.id)));
                }
            }
        }

        let mut keys = HashSet::new();
        for receipt in &body.receipts {
            if receipt.shard != shard {
                return Err(corrupt(format!(
                    "receipt {} was issued by {}",
                    receipt.key, receipt.shard
                )));
            }
            if !keys.insert(&receipt.key) {
                return Err(corrupt(format!("receipt {} appears twice", receipt.key)));
            }
        }
        Ok(())
    }

    /// Rebuild every book, keyed by target.
    pub fn rebuild_books(&self) -> Result<BTreeMap<Target, OrderBook>> {
        self.body
            .targets
            .iter()
            .map(|ts| Ok((ts.target.clone(), ts.rebuild()?)))
            .collect()
    }
}

// ── Storage ─────────────────────────────────────────────────────────

/// Where shard snapshots live. Blobs are opaque to the store.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, shard: ShardId, sequence: u64, blob: &[u8]) -> Result<()>;

    /// Most recent blob for `shard`, or `None` on first start.
    fn load_latest(&self, shard: ShardId) -> Result<Option<Vec<u8>>>;
}

fn store_err(path: &Path, err: &std::io::Error) -> DealbookError {
    DealbookError::SnapshotStore(format!("{}: {err}", path.display()))
}

/// Snapshots on disk: `<dir>/shard-NNNN/snapshot-<sequence>.json`.
///
/// Writes are atomic (temp file, fsync, rename) and only the newest
/// `keep` snapshots of each shard are retained.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    keep: usize,
}

impl FileSnapshotStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    #[must_use]
    pub fn shard_dir(&self, shard: ShardId) -> PathBuf {
        self.dir.join(format!("shard-{:04}", shard.0))
    }

    /// All snapshots of `shard` as `(sequence, path)`, ascending.
    pub fn list(&self, shard: ShardId) -> Result<Vec<(u64, PathBuf)>> {
        let dir = self.shard_dir(shard);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| store_err(&dir, &e))? {
            let entry = entry.map_err(|e| store_err(&dir, &e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(seq) = parse_sequence(&name) {
                results.push((seq, entry.path()));
            }
        }
        results.sort_by_key(|(seq, _)| *seq);
        Ok(results)
    }

    fn cleanup(&self, shard: ShardId) -> Result<()> {
        let snapshots = self.list(shard)?;
        if snapshots.len() > self.keep {
            let to_remove = snapshots.len() - self.keep;
            for (_, path) in snapshots.iter().take(to_remove) {
                fs::remove_file(path).map_err(|e| store_err(path, &e))?;
                tracing::debug!(path = %path.display(), "old snapshot removed");
            }
        }
        Ok(())
    }
}

fn parse_sequence(filename: &str) -> Option<u64> {
    filename
        .strip_prefix("snapshot-")?
        .strip_suffix(".json")?
        .parse::<u64>()
        .ok()
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, shard: ShardId, sequence: u64, blob: &[u8]) -> Result<()> {
        let dir = self.shard_dir(shard);
        fs::create_dir_all(&dir).map_err(|e| store_err(&dir, &e))?;

        let filename = format!("snapshot-{sequence:012}.json");
        let path = dir.join(&filename);
        let tmp_path = dir.join(format!("{filename}.tmp"));

        {
            let mut file = File::create(&tmp_path).map_err(|e| store_err(&tmp_path, &e))?;
            file.write_all(blob).map_err(|e| store_err(&tmp_path, &e))?;
            file.sync_all().map_err(|e| store_err(&tmp_path, &e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| store_err(&path, &e))?;

        self.cleanup(shard)
    }

    fn load_latest(&self, shard: ShardId) -> Result<Option<Vec<u8>>> {
        let Some((_, path)) = self.list(shard)?.pop() else {
            return Ok(None);
        };
        let blob = fs::read(&path).map_err(|e| store_err(&path, &e))?;
        Ok(Some(blob))
    }
}

/// Snapshots held in memory; survives shard restarts within one process.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<ShardId, (u64, Vec<u8>)>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence of the latest snapshot saved for `shard`.
    #[must_use]
    pub fn latest_sequence(&self, shard: ShardId) -> Option<u64> {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(&shard).map(|(seq, _)| *seq))
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, shard: ShardId, sequence: u64, blob: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| DealbookError::SnapshotStore("snapshot map poisoned".into()))?;
        blobs.insert(shard, (sequence, blob.to_vec()));
        Ok(())
    }

    fn load_latest(&self, shard: ShardId) -> Result<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| DealbookError::SnapshotStore("snapshot map poisoned".into()))?;
        Ok(blobs.get(&shard).map(|(_, blob)| blob.clone()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
