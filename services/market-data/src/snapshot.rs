//! Cache checkpoint file
//!
//! The candle cache and the dispatcher's frame list are checkpointed
//! together as one JSON document:
//!
//! ```json
//! { "version": 1, "frames": [...], "candles": [...], "seenTrades": [...], "checksum": "<sha256>" }
//! ```
//!
//! `seenTrades` holds the applied trade ids that a resume or gap fetch can
//! read again, so the next run skips them.
//!
//! Each checkpoint fully replaces the previous file (tmp write, fsync,
//! rename). A missing file is a cold start; an unreadable, unparsable or
//! checksum-mismatched file is reported as an error and the caller falls
//! back to a cold start.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::candles::Candle;
use crate::ingestion::SeenTrade;
use crate::timeframe::TimeFrames;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    #[error("Checkpoint task failed: {0}")]
    Task(String),
}

/// Persisted frames plus flattened candles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub frames: TimeFrames,
    pub candles: Vec<Candle>,
    #[serde(default)]
    pub seen_trades: Vec<SeenTrade>,
    /// SHA-256 over frames, candles and seen trades.
    pub checksum: String,
}

impl Snapshot {
    pub fn new(frames: TimeFrames, candles: Vec<Candle>) -> Self {
        let checksum = compute_checksum(&frames, &candles, &[]);
        Self {
            version: SNAPSHOT_VERSION,
            frames,
            candles,
            seen_trades: Vec::new(),
            checksum,
        }
    }

    pub fn with_seen_trades(mut self, seen_trades: Vec<SeenTrade>) -> Self {
        self.seen_trades = seen_trades;
        self.checksum = compute_checksum(&self.frames, &self.candles, &self.seen_trades);
        self
    }

    pub fn verify_integrity(&self) -> bool {
        self.checksum == self.expected_checksum()
    }

    fn expected_checksum(&self) -> String {
        compute_checksum(&self.frames, &self.candles, &self.seen_trades)
    }
}

fn compute_checksum(frames: &TimeFrames, candles: &[Candle], seen_trades: &[SeenTrade]) -> String {
    let mut hasher = Sha256::new();
    for frame in frames.as_slice() {
        hasher.update(frame.first_time.to_be_bytes());
        hasher.update(frame.last_time.to_be_bytes());
    }
    for candle in candles {
        hasher.update(candle.instrument_key.as_str().as_bytes());
        hasher.update(candle.duration.to_be_bytes());
        hasher.update(candle.unit.as_str().as_bytes());
        hasher.update(candle.timestamp_ms.to_be_bytes());
        hasher.update(candle.open.to_string().as_bytes());
        hasher.update(candle.high.to_string().as_bytes());
        hasher.update(candle.low.to_string().as_bytes());
        hasher.update(candle.close.to_string().as_bytes());
        hasher.update(candle.volume.to_string().as_bytes());
        hasher.update(candle.volume_by_quote.to_string().as_bytes());
        hasher.update(candle.count.to_be_bytes());
        hasher.update(candle.open_time.to_be_bytes());
        hasher.update(candle.close_time.to_be_bytes());
    }
    for seen in seen_trades {
        hasher.update(seen.id.to_string().as_bytes());
        hasher.update(seen.created_at.to_be_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Reads and writes the checkpoint file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot atomically: serialize, write tmp, fsync, rename.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let data = serde_json::to_vec(snapshot)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let tmp_path = self.tmp_path();
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Load the snapshot. `Ok(None)` when no file exists.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let snapshot: Snapshot = serde_json::from_slice(&data)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }

        if !snapshot.verify_integrity() {
            return Err(SnapshotError::IntegrityFailure {
                expected: snapshot.checksum.clone(),
                actual: snapshot.expected_checksum(),
            });
        }

        Ok(Some(snapshot))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "market-data.snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
