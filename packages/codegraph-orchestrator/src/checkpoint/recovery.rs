use super::envelope;
use super::store::CheckpointStore;
use crate::dag::CacheKey;
use crate::error::Result;
use crate::job::StageId;
use crate::wal::WalRecord;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// A checkpoint that must be regenerated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidatedCheckpoint {
    /// Job that was writing it, when known
    pub job_id: Option<Uuid>,
    pub stage: StageId,
    pub cache_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Checkpoints that passed verification
    pub valid: usize,
    /// Intents whose rename had happened; commit appended during recovery
    pub completed: Vec<String>,
    pub invalidated: Vec<InvalidatedCheckpoint>,
    pub temp_files_removed: usize,
    pub torn_bytes: u64,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.completed.is_empty()
            && self.invalidated.is_empty()
            && self.temp_files_removed == 0
            && self.torn_bytes == 0
    }
}

impl CheckpointStore {
    /// Settle the log left by the previous process and verify stored checkpoints.
    ///
    /// Never repairs a payload: every checkpoint is either verified as-is or
    /// reported for regeneration.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let replay = self.replay.lock().take().unwrap_or_default();
        let mut report = RecoveryReport {
            torn_bytes: replay.torn_bytes,
            ..Default::default()
        };

        for intent in replay.pending_intents() {
            let WalRecord::Intent {
                lsn,
                cache_key,
                job_id,
                checksum,
                temp_path,
                ..
            } = intent
            else {
                continue;
            };

            let Ok(key) = CacheKey::parse(&cache_key) else {
                warn!(cache_key = %cache_key, "Unparseable cache key in WAL intent");
                self.wal.append_abort(lsn, &cache_key, "unparseable key").await?;
                continue;
            };

            let landed = match self.read_checkpoint(&key).await {
                Ok(Some(checkpoint)) => checkpoint.header.checksum == checksum,
                _ => false,
            };

            if landed {
                self.wal.append_commit(lsn, &cache_key).await?;
                report.completed.push(cache_key);
                continue;
            }

            if self.remove_file_synced(&temp_path).await? {
                report.temp_files_removed += 1;
            }
            self.wal
                .append_abort(lsn, &cache_key, "incomplete at recovery")
                .await?;

            warn!(
                cache_key = %cache_key,
                job_id = %job_id,
                "Checkpoint write did not complete; stage must be re-executed"
            );
            report.invalidated.push(InvalidatedCheckpoint {
                job_id: Some(job_id),
                stage: key.stage,
                cache_key,
                reason: "write interrupted before rename".to_string(),
            });
        }

        report.temp_files_removed += self.sweep_orphan_temps().await?;
        self.verify_all(&mut report).await?;

        // intents from the previous process are all settled now
        self.wal.compact().await?;

        if report.is_clean() {
            info!(valid = report.valid, "Checkpoint recovery: clean");
        } else {
            warn!(
                valid = report.valid,
                completed = report.completed.len(),
                invalidated = report.invalidated.len(),
                temp_files_removed = report.temp_files_removed,
                torn_bytes = report.torn_bytes,
                "Checkpoint recovery finished with repairs"
            );
        }
        Ok(report)
    }

    /// Temp files with no live writer
    async fn sweep_orphan_temps(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(self.tmp_dir()).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(key) = Self::key_of_temp(&path) {
                if self.in_flight.contains_key(&key) {
                    continue;
                }
            }
            if self.remove_file_synced(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Full verification of every committed checkpoint; corrupt files are removed.
    async fn verify_all(&self, report: &mut RecoveryReport) -> Result<()> {
        for stored in self.list().await? {
            if self.is_writing(&stored.key) {
                continue;
            }

            let error = match tokio::fs::read(&stored.path).await {
                Ok(bytes) => match envelope::decode(&stored.key, &bytes) {
                    Ok(_) => {
                        report.valid += 1;
                        continue;
                    }
                    Err(e) => e.to_string(),
                },
                Err(e) => e.to_string(),
            };

            warn!(cache_key = %stored.key, error = %error, "Removing corrupt checkpoint");
            self.remove_file_synced(&stored.path).await?;

            let cache_key = stored.key.to_string();
            if report
                .invalidated
                .iter()
                .any(|inv| inv.cache_key == cache_key)
            {
                continue;
            }
            report.invalidated.push(InvalidatedCheckpoint {
                job_id: stored.header.map(|h| h.job_id),
                stage: stored.key.stage,
                cache_key,
                reason: error,
            });
        }
        Ok(())
    }
}
