use super::store::{CheckpointStore, StoredCheckpoint};
use crate::config::RetentionPolicy;
use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

/// ~100 years
const MAX_AGE_CAP_SECS: u64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub kept: usize,
    /// Lineages left untouched because none of their checkpoints verified
    pub unverified_lineages: usize,
}

impl CheckpointStore {
    /// Apply retention per `(repository, stage)` lineage.
    ///
    /// A checkpoint goes when it is ranked past `keep_last` or older than
    /// `max_age_secs`, unless it is pinned, being written, or the newest
    /// checkpoint of its lineage that passes verification.
    pub async fn prune(&self, policy: &RetentionPolicy) -> Result<PruneReport> {
        let pinned: HashSet<&str> = policy.pinned.iter().map(String::as_str).collect();
        let max_age = policy
            .max_age_secs
            .map(|secs| Duration::seconds(secs.min(MAX_AGE_CAP_SECS) as i64));
        let now = Utc::now();

        let mut lineages: BTreeMap<(String, StageId), Vec<StoredCheckpoint>> = BTreeMap::new();
        let mut report = PruneReport::default();

        for stored in self.list().await? {
            if stored.header.is_some() {
                lineages
                    .entry((stored.key.repo_id.clone(), stored.key.stage.clone()))
                    .or_default()
                    .push(stored);
            } else {
                // unreadable headers are left for recovery to judge
                report.kept += 1;
            }
        }

        for ((repo_id, stage), mut entries) in lineages {
            // newest first
            entries.sort_by(|a, b| {
                let a = a.header.as_ref().map(|h| h.created_at);
                let b = b.header.as_ref().map(|h| h.created_at);
                b.cmp(&a)
            });

            let mut newest_valid = None;
            for (i, entry) in entries.iter().enumerate() {
                if self.is_valid(&entry.key).await {
                    newest_valid = Some(i);
                    break;
                }
            }
            let Some(newest_valid) = newest_valid else {
                debug!(repo_id = %repo_id, stage = %stage, "No verified checkpoint in lineage; skipping");
                report.unverified_lineages += 1;
                report.kept += entries.len();
                continue;
            };

            for (rank, entry) in entries.iter().enumerate() {
                let key = entry.key.to_string();
                let expired = match (max_age, &entry.header) {
                    (Some(max_age), Some(header)) => now - header.created_at > max_age,
                    _ => false,
                };
                let protected = rank == newest_valid
                    || pinned.contains(key.as_str())
                    || self.is_writing(&entry.key);

                // anything newer than the newest valid copy failed verification
                let ahead_of_valid = rank < newest_valid;

                if protected || ahead_of_valid || (rank < policy.keep_last && !expired) {
                    report.kept += 1;
                    continue;
                }

                if self.remove_if_unchanged(entry).await? {
                    debug!(cache_key = %key, rank, expired, "Pruned checkpoint");
                    report.removed.push(key);
                } else {
                    debug!(cache_key = %key, "Checkpoint rewritten since listing; kept");
                    report.kept += 1;
                }
            }
        }

        info!(
            removed = report.removed.len(),
            kept = report.kept,
            "Checkpoint retention applied"
        );
        Ok(report)
    }
}

impl CheckpointStore {
    /// Delete a listed checkpoint only if the file on disk is still the one
    /// that was listed. The key's writer slot is held across the check and
    /// the unlink, so a concurrent commit cannot slip in between.
    pub(crate) async fn remove_if_unchanged(&self, stored: &StoredCheckpoint) -> Result<bool> {
        let _guard = match self.acquire(&stored.key.to_string(), Uuid::nil()) {
            Ok(guard) => guard,
            Err(OrchestratorError::ConcurrentWrite(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        match self.header(&stored.key).await {
            Ok(Some(current)) if stored.header.as_ref() == Some(&current) => {
                self.remove_file_synced(&stored.path).await
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::CacheKey;
    use tempfile::TempDir;

    fn key(snapshot: &str) -> CacheKey {
        CacheKey::new(StageId::IR, "repo", snapshot)
    }

    async fn store_with_snapshots(dir: &TempDir, snapshots: &[&str]) -> CheckpointStore {
        let store = CheckpointStore::open_at(dir.path(), false).await.unwrap();
        for snap in snapshots {
            store.write(&key(snap), Uuid::new_v4(), snap.as_bytes()).await.unwrap();
            // distinct creation times
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        store
    }

    #[tokio::test]
    async fn test_keep_last_n() {
        let dir = TempDir::new().unwrap();
        let store = store_with_snapshots(&dir, &["s1", "s2", "s3", "s4"]).await;

        let policy = RetentionPolicy {
            keep_last: 2,
            ..Default::default()
        };
        let report = store.prune(&policy).await.unwrap();

        assert_eq!(
            report.removed,
            vec!["ir:repo:s2".to_string(), "ir:repo:s1".to_string()]
        );
        assert!(store.is_valid(&key("s4")).await);
        assert!(store.is_valid(&key("s3")).await);
    }

    #[tokio::test]
    async fn test_pinned_survive() {
        let dir = TempDir::new().unwrap();
        let store = store_with_snapshots(&dir, &["s1", "s2", "s3"]).await;

        let policy = RetentionPolicy {
            keep_last: 1,
            max_age_secs: None,
            pinned: vec!["ir:repo:s1".to_string()],
        };
        let report = store.prune(&policy).await.unwrap();

        assert_eq!(report.removed, vec!["ir:repo:s2".to_string()]);
        assert!(store.is_valid(&key("s1")).await);
    }

    #[tokio::test]
    async fn test_max_age_never_removes_newest_valid() {
        let dir = TempDir::new().unwrap();
        let store = store_with_snapshots(&dir, &["s1", "s2"]).await;

        let policy = RetentionPolicy {
            keep_last: 10,
            max_age_secs: Some(0),
            pinned: vec![],
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let report = store.prune(&policy).await.unwrap();

        assert_eq!(report.removed, vec!["ir:repo:s1".to_string()]);
        assert!(store.is_valid(&key("s2")).await);
    }

    #[tokio::test]
    async fn test_corrupt_newest_keeps_older_valid_copy() {
        let dir = TempDir::new().unwrap();
        let store = store_with_snapshots(&dir, &["s1", "s2", "s3"]).await;

        // newest checkpoint fails verification
        let path = store.path_for(&key("s3"));
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        let policy = RetentionPolicy {
            keep_last: 1,
            ..Default::default()
        };
        let report = store.prune(&policy).await.unwrap();

        // s2 is the newest valid copy and stays; s1 goes
        assert_eq!(report.removed, vec!["ir:repo:s1".to_string()]);
        assert!(store.is_valid(&key("s2")).await);
    }

    #[tokio::test]
    async fn test_lineages_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open_at(dir.path(), false).await.unwrap();
        for repo in ["a", "b"] {
            store
                .write(&CacheKey::new(StageId::IR, repo, "s1"), Uuid::new_v4(), b"x")
                .await
                .unwrap();
        }

        let policy = RetentionPolicy {
            keep_last: 1,
            ..Default::default()
        };
        let report = store.prune(&policy).await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 2);
    }

    #[tokio::test]
    async fn test_rewritten_checkpoint_survives_stale_listing() {
        let dir = TempDir::new().unwrap();
        let store = store_with_snapshots(&dir, &["s1", "s2"]).await;

        let listed = store.list().await.unwrap();
        let stale = listed.iter().find(|s| s.key == key("s1")).unwrap();

        // a writer replaces s1 after the listing
        store.write(&key("s1"), Uuid::new_v4(), b"fresh").await.unwrap();

        assert!(!store.remove_if_unchanged(stale).await.unwrap());
        assert_eq!(store.read(&key("s1")).await.unwrap(), Some(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn test_removal_waits_for_writer_slot() {
        let dir = TempDir::new().unwrap();
        let store = store_with_snapshots(&dir, &["s1"]).await;
        let listed = store.list().await.unwrap();

        let pending = store.prepare(&key("s1"), Uuid::new_v4(), b"next").await.unwrap();
        assert!(!store.remove_if_unchanged(&listed[0]).await.unwrap());
        pending.commit().await.unwrap();
        assert_eq!(store.read(&key("s1")).await.unwrap(), Some(b"next".to_vec()));

        // an unchanged listing entry is removed
        let listed = store.list().await.unwrap();
        assert!(store.remove_if_unchanged(&listed[0]).await.unwrap());
        assert_eq!(store.read(&key("s1")).await.unwrap(), None);
    }
}
