/// Dependency graph utilities for incremental update
///
/// - Reverse dependency index: O(1) lookup for "who imports this"
/// - Forward map (file → targets) for explicit per-file invalidation
/// - BFS affected files detection: O(V+E) transitive propagation
/// - Concurrent access with DashMap; one index per repository, owned by the
///   orchestrator instance (`DependencyIndexes`)
use crate::error::Result;
use crate::job::StageId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File ID (repository-relative path)
pub type FileId = PathBuf;

/// Stage segment of the cache key under which a repository's index is persisted
pub const INDEX_STAGE: StageId = StageId::from_static("depindex");

const EXPORT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct IndexExport {
    version: u32,
    /// importing file → imported targets, sorted
    edges: BTreeMap<FileId, BTreeSet<FileId>>,
}

/// Reverse dependency index
///
/// Maps imported target → {files that import it}. Each `record_import` is a
/// single shard-locked insertion, so readers see an edge entirely or not at all.
#[derive(Debug, Default)]
pub struct ReverseDependencyIndex {
    /// target → importers
    reverse_deps: DashMap<FileId, HashSet<FileId>>,
    /// importer → targets
    forward_deps: DashMap<FileId, HashSet<FileId>>,
}

impl ReverseDependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `importing_file` imports `target`. Idempotent.
    pub fn record_import(&self, importing_file: impl Into<FileId>, target: impl Into<FileId>) {
        let importing_file = importing_file.into();
        let target = target.into();

        self.forward_deps
            .entry(importing_file.clone())
            .or_default()
            .insert(target.clone());
        self.reverse_deps
            .entry(target)
            .or_default()
            .insert(importing_file);
    }

    /// Get all files that import the given target
    pub fn importers_of(&self, target: &Path) -> HashSet<FileId> {
        self.reverse_deps
            .get(target)
            .map(|files| files.clone())
            .unwrap_or_default()
    }

    /// Targets imported by a file
    pub fn imports_of(&self, file: &Path) -> HashSet<FileId> {
        self.forward_deps
            .get(file)
            .map(|targets| targets.clone())
            .unwrap_or_default()
    }

    /// Files with at least one recorded import, sorted
    pub fn importing_files(&self) -> Vec<FileId> {
        let mut files: Vec<FileId> = self.forward_deps.iter().map(|e| e.key().clone()).collect();
        files.sort();
        files
    }

    /// Remove every edge recorded *by* `file` (before it is re-analyzed).
    ///
    /// Returns the number of edges removed.
    pub fn invalidate_file(&self, file: &Path) -> usize {
        let targets = match self.forward_deps.remove(file) {
            Some((_, targets)) => targets,
            None => return 0,
        };

        for target in &targets {
            if let Some(mut importers) = self.reverse_deps.get_mut(target) {
                importers.remove(file);
            }
            self.reverse_deps
                .remove_if(target, |_, importers| importers.is_empty());
        }

        targets.len()
    }

    /// Remove a target and every edge pointing at it (e.g. a deleted file)
    pub fn remove_target(&self, target: &Path) -> usize {
        let importers = match self.reverse_deps.remove(target) {
            Some((_, importers)) => importers,
            None => return 0,
        };

        for importer in &importers {
            if let Some(mut targets) = self.forward_deps.get_mut(importer) {
                targets.remove(target);
            }
            self.forward_deps
                .remove_if(importer, |_, targets| targets.is_empty());
        }

        importers.len()
    }

    /// Transitive closure of `changed_files` under "is imported by"
    pub fn compute_affected<I>(&self, changed_files: I) -> HashSet<FileId>
    where
        I: IntoIterator,
        I::Item: Into<FileId>,
    {
        let changed: HashSet<FileId> = changed_files.into_iter().map(Into::into).collect();
        compute_affected_files(&changed, self)
    }

    /// Clear all data (for rebuild)
    pub fn clear(&self) {
        self.reverse_deps.clear();
        self.forward_deps.clear();
    }

    /// Number of distinct import targets
    pub fn len(&self) -> usize {
        self.reverse_deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse_deps.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.forward_deps.iter().map(|entry| entry.value().len()).sum()
    }

    /// Serialize the index (bincode, deterministic order)
    pub fn export(&self) -> Result<Vec<u8>> {
        let edges = self
            .forward_deps
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().iter().cloned().collect::<BTreeSet<_>>(),
                )
            })
            .collect();

        let export = IndexExport {
            version: EXPORT_VERSION,
            edges,
        };
        Ok(bincode::serialize(&export)?)
    }

    /// Rebuild an index from `export()` output
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let export: IndexExport = bincode::deserialize(bytes)?;
        if export.version != EXPORT_VERSION {
            return Err(crate::error::OrchestratorError::serialization(format!(
                "unsupported dependency index version {}",
                export.version
            )));
        }

        let index = Self::new();
        for (file, targets) in export.edges {
            for target in targets {
                index.record_import(file.clone(), target);
            }
        }
        Ok(index)
    }
}

/// Compute affected files using BFS transitive dependency tracking
///
/// Algorithm: O(V+E) where V = affected files, E = import edges
/// 1. Start with changed files
/// 2. BFS: For each file, find all importers (reverse deps)
/// 3. Continue until no new affected files
///
/// Example:
/// ```text
/// A.py → B.py → C.py
///        ↓
///        D.py
///
/// If B.py changes:
/// - Direct: B.py
/// - Affected: A.py (imports B), C.py (imports B), D.py (imports B)
/// - Total: {A.py, B.py, C.py, D.py}
/// ```
pub fn compute_affected_files(
    changed_files: &HashSet<PathBuf>,
    reverse_deps: &ReverseDependencyIndex,
) -> HashSet<PathBuf> {
    let mut affected = HashSet::new();
    let mut queue = VecDeque::new();

    for file in changed_files {
        affected.insert(file.clone());
        queue.push_back(file.clone());
    }

    while let Some(current_file) = queue.pop_front() {
        for importer in reverse_deps.importers_of(&current_file) {
            // visited guard makes cycles harmless
            if affected.insert(importer.clone()) {
                queue.push_back(importer);
            }
        }
    }

    affected
}

/// Per-repository dependency indexes, owned by one orchestrator instance
#[derive(Debug, Default, Clone)]
pub struct DependencyIndexes {
    indexes: Arc<DashMap<String, Arc<ReverseDependencyIndex>>>,
}

impl DependencyIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, repo_id: &str) -> Option<Arc<ReverseDependencyIndex>> {
        self.indexes.get(repo_id).map(|index| Arc::clone(&index))
    }

    pub fn get_or_create(&self, repo_id: &str) -> Arc<ReverseDependencyIndex> {
        Arc::clone(
            &self
                .indexes
                .entry(repo_id.to_string())
                .or_insert_with(|| Arc::new(ReverseDependencyIndex::new())),
        )
    }

    /// Adopt `index` unless the repository already has one; returns the
    /// instance every caller shares.
    pub fn get_or_insert(
        &self,
        repo_id: impl Into<String>,
        index: ReverseDependencyIndex,
    ) -> Arc<ReverseDependencyIndex> {
        Arc::clone(
            &self
                .indexes
                .entry(repo_id.into())
                .or_insert_with(|| Arc::new(index)),
        )
    }

    pub fn remove(&self, repo_id: &str) -> Option<Arc<ReverseDependencyIndex>> {
        self.indexes.remove(repo_id).map(|(_, index)| index)
    }

    pub fn contains(&self, repo_id: &str) -> bool {
        self.indexes.contains_key(repo_id)
    }

    pub fn repositories(&self) -> Vec<String> {
        let mut repos: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        repos.sort();
        repos
    }
}
