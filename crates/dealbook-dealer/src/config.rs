//! Dealer configuration.
//!
//! Read from environment variables, each falling back to its default:
//!
//! - `DEALBOOK_SHARDS`          (default: 4)
//! - `DEALBOOK_TARGETS`         comma-separated symbols; empty accepts any
//! - `DEALBOOK_SNAPSHOT_DIR`    (default: "./snapshots")
//! - `DEALBOOK_SNAPSHOT_EVERY`  commands between snapshots, 0 disables
//! - `DEALBOOK_CLAIM_TTL_SECS`  (default: 300)
//! - `DEALBOOK_LOG`             filter used when `RUST_LOG` is unset
//! - `DEALBOOK_LOG_JSON`        "1" or "true" for JSON logs

use std::path::PathBuf;
use std::str::FromStr;

use dealbook_types::{DealbookError, EngineConfig, Result, Target};

const DEFAULT_SNAPSHOT_DIR: &str = "./snapshots";
const DEFAULT_LOG: &str = "info";

#[derive(Debug, Clone)]
pub struct DealbookConfig {
    pub engine: EngineConfig,
    pub snapshot_dir: PathBuf,
    pub log: String,
    pub log_json: bool,
}

impl DealbookConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            shard_count: parse_or(&lookup, "DEALBOOK_SHARDS", defaults.shard_count)?,
            targets: lookup("DEALBOOK_TARGETS")
                .map(|raw| parse_targets(&raw))
                .unwrap_or_default(),
            snapshot_every: parse_or(&lookup, "DEALBOOK_SNAPSHOT_EVERY", defaults.snapshot_every)?,
            claim_ttl_secs: parse_or(&lookup, "DEALBOOK_CLAIM_TTL_SECS", defaults.claim_ttl_secs)?,
            ..defaults
        };
        engine.validate()?;

        Ok(Self {
            engine,
            snapshot_dir: lookup("DEALBOOK_SNAPSHOT_DIR")
                .map_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR), PathBuf::from),
            log: lookup("DEALBOOK_LOG").unwrap_or_else(|| DEFAULT_LOG.to_string()),
            log_json: lookup("DEALBOOK_LOG_JSON").is_some_and(|v| parse_flag(&v)),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| DealbookError::Configuration(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn parse_targets(raw: &str) -> Vec<Target> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Target::new)
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
