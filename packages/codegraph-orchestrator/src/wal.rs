//! Write-ahead log for checkpoint writes
//!
//! Line-oriented frames: `<fnv1a32 hex> <json record>\n`. A frame that is
//! truncated or fails its checksum marks the end of the known-good prefix;
//! everything after it is discarded on open.
//!
//! Appends go through one async mutex (single writer position). Payload
//! writes happen outside the log and are not serialized by it.
//!
//! Once enough settled records (commits, aborts and the intents they close)
//! pile up, the log is rewritten to hold only the open intents.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Log sequence number
pub type Lsn = u64;

/// Settled records tolerated before an automatic compaction
pub const DEFAULT_COMPACT_AFTER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalRecord {
    /// A checkpoint write is about to start
    Intent {
        lsn: Lsn,
        cache_key: String,
        job_id: Uuid,
        /// sha256 of the payload, hex
        checksum: String,
        temp_path: PathBuf,
        at: DateTime<Utc>,
    },
    /// The checkpoint was renamed into place
    Commit {
        lsn: Lsn,
        intent: Lsn,
        cache_key: String,
        at: DateTime<Utc>,
    },
    /// The write was abandoned; the temp file is gone
    Abort {
        lsn: Lsn,
        intent: Lsn,
        cache_key: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl WalRecord {
    pub fn lsn(&self) -> Lsn {
        match self {
            WalRecord::Intent { lsn, .. }
            | WalRecord::Commit { lsn, .. }
            | WalRecord::Abort { lsn, .. } => *lsn,
        }
    }

    pub fn cache_key(&self) -> &str {
        match self {
            WalRecord::Intent { cache_key, .. }
            | WalRecord::Commit { cache_key, .. }
            | WalRecord::Abort { cache_key, .. } => cache_key,
        }
    }
}

/// Result of scanning the log on open
#[derive(Debug, Default)]
pub struct WalReplay {
    pub records: Vec<WalRecord>,
    /// Bytes dropped after the last known-good frame
    pub torn_bytes: u64,
}

impl WalReplay {
    /// Intents with no matching commit or abort, in log order
    pub fn pending_intents(&self) -> Vec<WalRecord> {
        let mut open: BTreeMap<Lsn, WalRecord> = BTreeMap::new();
        for record in &self.records {
            match record {
                WalRecord::Intent { lsn, .. } => {
                    open.insert(*lsn, record.clone());
                }
                WalRecord::Commit { intent, .. } | WalRecord::Abort { intent, .. } => {
                    open.remove(intent);
                }
            }
        }
        open.into_values().collect()
    }
}

/// FNV-1a, 32 bit (frame corruption detection only)
fn frame_checksum(data: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

fn encode_frame(record: &WalRecord) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(record)?;
    let mut frame = format!("{:08x} ", frame_checksum(&json)).into_bytes();
    frame.extend_from_slice(&json);
    frame.push(b'\n');
    Ok(frame)
}

/// Parse frames up to the first torn or corrupt one.
///
/// Returns the records and the length of the valid prefix.
fn scan_frames(data: &[u8]) -> (Vec<WalRecord>, usize) {
    let mut records = Vec::new();
    let mut good = 0usize;

    while good < data.len() {
        let rest = &data[good..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line = &rest[..newline];

        if line.len() < 10 || line[8] != b' ' {
            break;
        }
        let expected = match std::str::from_utf8(&line[..8])
            .ok()
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        {
            Some(crc) => crc,
            None => break,
        };
        let body = &line[9..];
        if frame_checksum(body) != expected {
            break;
        }
        match serde_json::from_slice::<WalRecord>(body) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }

        good += newline + 1;
    }

    (records, good)
}

struct WalWriter {
    file: File,
    next_lsn: Lsn,
    /// Intents with no commit or abort yet
    open: BTreeMap<Lsn, WalRecord>,
    /// Frames currently in the file
    records: usize,
}

impl WalWriter {
    fn settle(&mut self, record: &WalRecord) {
        match record {
            WalRecord::Intent { lsn, .. } => {
                self.open.insert(*lsn, record.clone());
            }
            WalRecord::Commit { intent, .. } | WalRecord::Abort { intent, .. } => {
                self.open.remove(intent);
            }
        }
    }

    fn settled(&self) -> usize {
        self.records.saturating_sub(self.open.len())
    }
}

/// Durable, append-only intent log
pub struct WriteAheadLog {
    path: PathBuf,
    fsync: bool,
    /// 0 disables automatic compaction
    compact_after: usize,
    writer: Mutex<WalWriter>,
}

impl WriteAheadLog {
    /// Open (or create) the log, truncating any torn tail.
    pub async fn open(path: impl AsRef<Path>, fsync: bool) -> Result<(Self, WalReplay)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (records, good) = scan_frames(&data);
        let torn_bytes = (data.len() - good) as u64;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        if torn_bytes > 0 {
            warn!(
                wal = %path.display(),
                torn_bytes,
                valid_records = records.len(),
                "Discarding torn WAL tail"
            );
            file.set_len(good as u64).await?;
            if fsync {
                file.sync_all().await?;
            }
        }

        file.seek(std::io::SeekFrom::End(0)).await?;

        let next_lsn = records.iter().map(WalRecord::lsn).max().map_or(1, |l| l + 1);
        debug!(wal = %path.display(), records = records.len(), next_lsn, "WAL opened");

        let replay = WalReplay {
            records,
            torn_bytes,
        };
        let writer = WalWriter {
            file,
            next_lsn,
            open: replay
                .pending_intents()
                .into_iter()
                .map(|record| (record.lsn(), record))
                .collect(),
            records: replay.records.len(),
        };

        Ok((
            Self {
                path,
                fsync,
                compact_after: DEFAULT_COMPACT_AFTER,
                writer: Mutex::new(writer),
            },
            replay,
        ))
    }

    /// Compact automatically once this many settled records accumulate
    pub fn set_compact_after(&mut self, records: usize) {
        self.compact_after = records;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_with<F>(&self, sync: bool, build: F) -> Result<Lsn>
    where
        F: FnOnce(Lsn) -> WalRecord,
    {
        let mut writer = self.writer.lock().await;
        let lsn = writer.next_lsn;
        let record = build(lsn);
        let frame = encode_frame(&record)?;

        writer.file.write_all(&frame).await?;
        writer.file.flush().await?;
        if sync && self.fsync {
            writer.file.sync_data().await?;
        }

        writer.next_lsn += 1;
        writer.records += 1;
        writer.settle(&record);

        if self.compact_after > 0 && writer.settled() >= self.compact_after {
            // the record is durable already; a failed rewrite only delays compaction
            if let Err(e) = self.rewrite(&mut writer).await {
                warn!(wal = %self.path.display(), "WAL compaction failed: {}", e);
            }
        }
        Ok(lsn)
    }

    /// Record write intent; durable before this returns.
    pub async fn append_intent(
        &self,
        cache_key: &str,
        job_id: Uuid,
        checksum: &str,
        temp_path: &Path,
    ) -> Result<Lsn> {
        self.append_with(true, |lsn| WalRecord::Intent {
            lsn,
            cache_key: cache_key.to_string(),
            job_id,
            checksum: checksum.to_string(),
            temp_path: temp_path.to_path_buf(),
            at: Utc::now(),
        })
        .await
    }

    pub async fn append_commit(&self, intent: Lsn, cache_key: &str) -> Result<Lsn> {
        self.append_with(false, |lsn| WalRecord::Commit {
            lsn,
            intent,
            cache_key: cache_key.to_string(),
            at: Utc::now(),
        })
        .await
    }

    pub async fn append_abort(&self, intent: Lsn, cache_key: &str, reason: &str) -> Result<Lsn> {
        self.append_with(false, |lsn| WalRecord::Abort {
            lsn,
            intent,
            cache_key: cache_key.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        })
        .await
    }

    /// Rewrite the log so it holds only the open intents (tmp + rename).
    ///
    /// Sequence numbers keep increasing across compactions.
    pub async fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.rewrite(&mut writer).await
    }

    async fn rewrite(&self, writer: &mut WalWriter) -> Result<()> {
        let mut buffer = Vec::new();
        for record in writer.open.values() {
            buffer.extend(encode_frame(record)?);
        }

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path).await?;
            tmp.write_all(&buffer).await?;
            tmp.flush().await?;
            if self.fsync {
                tmp.sync_all().await?;
            }
        }
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            OrchestratorError::Io(std::io::Error::new(
                e.kind(),
                format!("WAL compaction rename failed: {}", e),
            ))
        })?;

        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.flush().await?;
        writer.file = file;
        writer.records = writer.open.len();

        debug!(wal = %self.path.display(), kept = writer.records, "WAL compacted");
        Ok(())
    }
}
