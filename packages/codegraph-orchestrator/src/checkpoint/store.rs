use super::envelope::{self, CheckpointHeader, PREAMBLE_LEN};
use super::Checkpoint;
use crate::config::StorageConfig;
use crate::dag::CacheKey;
use crate::error::{OrchestratorError, Result};
use crate::wal::{Lsn, WalReplay, WriteAheadLog};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

const CHECKPOINT_EXT: &str = "ckpt";
const TEMP_EXT: &str = "tmp";

/// File name for a cache key. Bytes outside `[A-Za-z0-9._-]` become `%XX`.
pub(crate) fn encode_file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

pub(crate) fn decode_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// A checkpoint file found on disk
#[derive(Debug, Clone)]
pub struct StoredCheckpoint {
    pub key: CacheKey,
    pub path: PathBuf,
    /// `None` when the header cannot be read
    pub header: Option<CheckpointHeader>,
}

/// Releases the single-writer slot for a cache key on drop
pub(crate) struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, Uuid>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Durable checkpoint store
///
/// Layout under `root`:
/// - `wal.log`: intent log
/// - `checkpoints/<key>.ckpt`: committed checkpoints
/// - `tmp/<key>.<uuid>.tmp`: writes in progress
pub struct CheckpointStore {
    root: PathBuf,
    fsync: bool,
    pub(crate) wal: WriteAheadLog,
    /// Log contents at open, consumed by `recover`
    pub(crate) replay: Mutex<Option<WalReplay>>,
    /// cache key → writing job
    pub(crate) in_flight: DashMap<String, Uuid>,
}

impl CheckpointStore {
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let mut store = Self::open_at(&config.root, config.fsync).await?;
        store.wal.set_compact_after(config.wal_compact_after);
        Ok(store)
    }

    pub async fn open_at(root: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("checkpoints")).await?;
        tokio::fs::create_dir_all(root.join("tmp")).await?;

        let (wal, replay) = WriteAheadLog::open(root.join("wal.log"), fsync).await?;
        info!(
            root = %root.display(),
            wal_records = replay.records.len(),
            "Checkpoint store opened"
        );

        Ok(Self {
            root,
            fsync,
            wal,
            replay: Mutex::new(Some(replay)),
            in_flight: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.checkpoint_dir().join(format!(
            "{}.{}",
            encode_file_stem(&key.to_string()),
            CHECKPOINT_EXT
        ))
    }

    fn temp_path_for(&self, key: &CacheKey) -> PathBuf {
        self.tmp_dir().join(format!(
            "{}.{}.{}",
            encode_file_stem(&key.to_string()),
            Uuid::new_v4().simple(),
            TEMP_EXT
        ))
    }

    /// Cache key of a temp file name, if it is one of ours
    pub(crate) fn key_of_temp(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let mut parts = name.rsplitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(TEMP_EXT), Some(_uuid), Some(stem)) => decode_file_stem(stem),
            _ => None,
        }
    }

    pub(crate) fn acquire(&self, key: &str, job_id: Uuid) -> Result<InFlightGuard<'_>> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(_) => Err(OrchestratorError::ConcurrentWrite(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(job_id);
                Ok(InFlightGuard {
                    in_flight: &self.in_flight,
                    key: key.to_string(),
                })
            }
        }
    }

    pub fn is_writing(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(&key.to_string())
    }

    async fn sync_dir(&self, dir: &Path) -> Result<()> {
        if self.fsync {
            tokio::fs::File::open(dir).await?.sync_all().await?;
        }
        Ok(())
    }

    /// Steps 1–3 of a write: log the intent, write and sync the temp file.
    ///
    /// Nothing is visible to readers until `PendingWrite::commit`.
    pub async fn prepare(
        &self,
        key: &CacheKey,
        job_id: Uuid,
        payload: &[u8],
    ) -> Result<PendingWrite<'_>> {
        let key_str = key.to_string();
        let guard = self.acquire(&key_str, job_id)?;

        let header = CheckpointHeader::new(key, job_id, payload);
        let temp_path = self.temp_path_for(key);
        let lsn = self
            .wal
            .append_intent(&key_str, job_id, &header.checksum, &temp_path)
            .await?;

        let bytes = envelope::encode(&header, payload)?;
        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            if self.fsync {
                file.sync_all().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            self.wal.append_abort(lsn, &key_str, &e.to_string()).await?;
            return Err(e.into());
        }

        Ok(PendingWrite {
            store: self,
            key: key.clone(),
            lsn,
            temp_path,
            header,
            _guard: guard,
        })
    }

    /// Write a checkpoint atomically (intent, temp write, rename, commit)
    pub async fn write(
        &self,
        key: &CacheKey,
        job_id: Uuid,
        payload: &[u8],
    ) -> Result<CheckpointHeader> {
        self.prepare(key, job_id, payload).await?.commit().await
    }

    /// Read and verify a checkpoint. `Ok(None)` when absent.
    pub async fn read_checkpoint(&self, key: &CacheKey) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (header, payload) = envelope::decode(key, &bytes)?;
        Ok(Some(Checkpoint { header, payload }))
    }

    pub async fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.read_checkpoint(key).await?.map(|c| c.payload))
    }

    /// Present and passes verification
    pub async fn is_valid(&self, key: &CacheKey) -> bool {
        matches!(self.read_checkpoint(key).await, Ok(Some(_)))
    }

    /// Read only the header
    pub async fn header(&self, key: &CacheKey) -> Result<Option<CheckpointHeader>> {
        match read_header_at(&self.path_for(key), &key.to_string()).await {
            Ok(header) => Ok(Some(header)),
            Err(OrchestratorError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All checkpoint files, sorted by cache key
    pub async fn list(&self) -> Result<Vec<StoredCheckpoint>> {
        let mut entries = tokio::fs::read_dir(self.checkpoint_dir()).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_file_stem)
                .and_then(|s| CacheKey::parse(&s).ok())
            else {
                continue;
            };

            let header = read_header_at(&path, &key.to_string()).await.ok();
            found.push(StoredCheckpoint { key, path, header });
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    /// Remove a checkpoint on request. Returns whether a file was removed.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let key_str = key.to_string();
        let _guard = self.acquire(&key_str, Uuid::nil())?;

        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {
                self.sync_dir(&self.checkpoint_dir()).await?;
                info!(cache_key = %key_str, "Checkpoint invalidated");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn remove_file_synced(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    self.sync_dir(parent).await?;
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_header_at(path: &Path, key: &str) -> Result<CheckpointHeader> {
    let mut file = tokio::fs::File::open(path).await?;

    let mut preamble = [0u8; PREAMBLE_LEN];
    file.read_exact(&mut preamble)
        .await
        .map_err(|e| OrchestratorError::CorruptCheckpoint {
            cache_key: key.to_string(),
            reason: format!("short preamble: {}", e),
        })?;
    let len = envelope::header_len(key, &preamble)?;

    let mut header_bytes = vec![0u8; len];
    file.read_exact(&mut header_bytes)
        .await
        .map_err(|e| OrchestratorError::CorruptCheckpoint {
            cache_key: key.to_string(),
            reason: format!("short header: {}", e),
        })?;
    envelope::decode_header(key, &header_bytes)
}

/// A checkpoint whose temp file is written and whose intent is logged.
///
/// Dropping it without `commit` or `abort` leaves the same on-disk state as a
/// crash before the rename.
pub struct PendingWrite<'a> {
    store: &'a CheckpointStore,
    key: CacheKey,
    lsn: Lsn,
    temp_path: PathBuf,
    header: CheckpointHeader,
    _guard: InFlightGuard<'a>,
}

impl<'a> PendingWrite<'a> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Steps 4–5: rename into place, then mark the intent applied.
    ///
    /// On failure the temp file is removed and the intent aborted.
    pub async fn commit(self) -> Result<CheckpointHeader> {
        let final_path = self.store.path_for(&self.key);
        let key_str = self.key.to_string();

        let placed = async {
            tokio::fs::rename(&self.temp_path, &final_path).await?;
            self.store.sync_dir(&self.store.checkpoint_dir()).await
        };
        if let Err(e) = placed.await {
            let _ = tokio::fs::remove_file(&self.temp_path).await;
            self.store
                .wal
                .append_abort(self.lsn, &key_str, &e.to_string())
                .await?;
            return Err(e);
        }

        self.store.wal.append_commit(self.lsn, &key_str).await?;

        debug!(
            cache_key = %key_str,
            bytes = self.header.payload_len,
            lsn = self.lsn,
            "Checkpoint committed"
        );
        Ok(self.header)
    }

    pub async fn abort(self, reason: &str) -> Result<()> {
        self.store.remove_file_synced(&self.temp_path).await?;
        self.store
            .wal
            .append_abort(self.lsn, &self.key.to_string(), reason)
            .await?;
        Ok(())
    }
}
