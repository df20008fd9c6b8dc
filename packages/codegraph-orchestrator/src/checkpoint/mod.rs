//! Durable checkpoint storage
//!
//! Write path: WAL intent (synced) → temp file (synced) → rename → WAL commit.
//! Startup recovery (`recovery`) settles every unfinished intent, and
//! retention (`retention`) prunes old snapshots per lineage.

pub mod envelope;
pub mod recovery;
pub mod retention;
pub mod store;

pub use envelope::CheckpointHeader;
pub use recovery::{InvalidatedCheckpoint, RecoveryReport};
pub use retention::PruneReport;
pub use store::{CheckpointStore, PendingWrite, StoredCheckpoint};

use crate::dag::CacheKey;

/// A verified checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub header: CheckpointHeader,
    pub payload: Vec<u8>,
}

impl Checkpoint {
    pub fn cache_key(&self) -> CacheKey {
        self.header.cache_key()
    }
}
