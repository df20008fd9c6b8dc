//! Import scan stage
//!
//! Extracts `import` / `from ... import` statements from Python sources,
//! resolves them to files of the same snapshot and keeps the repository's
//! reverse dependency index current.
//!
//! Incremental mode rescans only affected files and merges the result into
//! the previous snapshot's output.

use crate::error::StageError;
use crate::files::FileSource;
use crate::job::StageId;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*import[ \t]+([^\n#;]+)").expect("import pattern is valid")
});

static FROM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+(\.*[\w.]*)[ \t]+import[ \t]+(\([^)]*\)|[^\n#;]+)")
        .expect("from-import pattern is valid")
});

/// One import statement, as written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement {
    /// Module path including leading dots for relative imports
    pub module: String,
    /// Names after `from ... import` (empty for plain `import`)
    pub names: Vec<String>,
}

impl ImportStatement {
    fn level(&self) -> usize {
        self.module.chars().take_while(|c| *c == '.').count()
    }

    fn dotted(&self) -> &str {
        self.module.trim_start_matches('.')
    }
}

/// Per-file scan result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImports {
    pub imports: Vec<String>,
    pub resolved: Vec<PathBuf>,
    /// Imports with no file in the snapshot (third-party, stdlib)
    pub unresolved: Vec<String>,
    pub errors: Vec<String>,
}

/// Stage checkpoint payload (JSON)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportScanOutput {
    pub files: BTreeMap<PathBuf, FileImports>,
}

impl ImportScanOutput {
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn edge_count(&self) -> usize {
        self.files.values().map(|f| f.resolved.len()).sum()
    }
}

/// Parse import statements out of Python source
pub fn parse_imports(source: &str) -> Vec<ImportStatement> {
    let mut statements = Vec::new();

    for caps in IMPORT_RE.captures_iter(source) {
        for part in caps[1].split(',') {
            let module = strip_alias(part);
            if !module.is_empty() {
                statements.push(ImportStatement {
                    module: module.to_string(),
                    names: Vec::new(),
                });
            }
        }
    }

    for caps in FROM_RE.captures_iter(source) {
        let names = caps[2]
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .map(strip_alias)
            .filter(|name| !name.is_empty() && *name != "*")
            .map(str::to_string)
            .collect();
        statements.push(ImportStatement {
            module: caps[1].to_string(),
            names,
        });
    }

    statements
}

fn strip_alias(part: &str) -> &str {
    let part = part.trim();
    match part.find(" as ") {
        Some(idx) => part[..idx].trim(),
        None => part.split_whitespace().next().unwrap_or(""),
    }
}

fn module_candidates(base: &Path, dotted: &str) -> Vec<PathBuf> {
    let mut path = base.to_path_buf();
    for segment in dotted.split('.').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    if dotted.is_empty() {
        // `from . import x` falling back to the package itself
        return vec![path.join("__init__.py")];
    }
    vec![path.with_extension("py"), path.join("__init__.py")]
}

fn first_known(candidates: &[PathBuf], known: &HashSet<PathBuf>) -> Option<PathBuf> {
    candidates.iter().find(|c| known.contains(*c)).cloned()
}

/// Resolve a statement to snapshot files; empty if nothing matches
pub fn resolve_import(
    file: &Path,
    statement: &ImportStatement,
    known: &HashSet<PathBuf>,
) -> Vec<PathBuf> {
    let level = statement.level();
    let base = if level == 0 {
        PathBuf::new()
    } else {
        // `.` is the importing file's package, each extra dot one level up
        let mut dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
        for _ in 1..level {
            if !dir.pop() {
                return Vec::new();
            }
        }
        dir
    };
    let dotted = statement.dotted();

    let mut targets = Vec::new();
    let mut module_needed = statement.names.is_empty();

    for name in &statement.names {
        let submodule = if dotted.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", dotted, name)
        };
        match first_known(&module_candidates(&base, &submodule), known) {
            Some(target) => targets.push(target),
            None => module_needed = true,
        }
    }

    if module_needed {
        let candidates = module_candidates(&base, dotted);
        if let Some(target) = first_known(&candidates, known) {
            targets.push(target);
        }
    }

    targets.retain(|t| t != file);
    targets.sort();
    targets.dedup();
    targets
}

fn scan_file(
    source: &dyn FileSource,
    repo_id: &str,
    file: &Path,
    known: &HashSet<PathBuf>,
) -> FileImports {
    let mut result = FileImports::default();

    let text = match source.read_to_string(repo_id, file) {
        Ok(text) => text,
        Err(e) => {
            result.errors.push(format!("read failed: {}", e));
            return result;
        }
    };

    for statement in parse_imports(&text) {
        let targets = resolve_import(file, &statement, known);
        if targets.is_empty() {
            result.unresolved.push(statement.module.clone());
        }
        result.imports.push(statement.module);
        result.resolved.extend(targets);
    }

    result.resolved.sort();
    result.resolved.dedup();
    result
}

/// Built-in stage that maintains the reverse dependency index
pub struct ImportScanStage {
    id: StageId,
}

impl ImportScanStage {
    pub fn new() -> Self {
        Self { id: StageId::IR }
    }

    /// Register under a different stage id
    pub fn with_stage_id(id: StageId) -> Self {
        Self { id }
    }
}

impl Default for ImportScanStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageHandler for ImportScanStage {
    fn stage_id(&self) -> StageId {
        self.id.clone()
    }

    fn maintains_dependency_index(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        input: StageInput,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let start = Instant::now();
        let mut warnings = Vec::new();

        let previous = if input.is_incremental() {
            match input.previous_output.as_deref().map(ImportScanOutput::from_bytes) {
                Some(Ok(previous)) => Some(previous),
                Some(Err(e)) => {
                    warn!("Previous import scan output unreadable ({}), rescanning all files", e);
                    warnings.push(format!("previous output unreadable: {}", e));
                    None
                }
                None => {
                    warn!("No previous import scan output, rescanning all files");
                    warnings.push("previous output missing; rescanned all files".to_string());
                    None
                }
            }
        } else {
            None
        };

        let files_to_process = if previous.is_some() {
            input.files_to_process()
        } else {
            input.files.clone()
        };

        info!(
            "Import scan: {} of {} files (incremental: {})",
            files_to_process.len(),
            input.files.len(),
            previous.is_some()
        );

        let known: HashSet<PathBuf> = input.files.iter().cloned().collect();
        let present = known.clone();
        let index = Arc::clone(&ctx.dependency_index);

        // Deleted files drop out of the index entirely
        let stale: Vec<PathBuf> = index
            .importing_files()
            .into_iter()
            .filter(|f| !known.contains(f))
            .collect();
        for file in &stale {
            index.invalidate_file(file);
        }
        if let Some(changed) = &input.changed_files {
            for file in changed.iter().filter(|f| !known.contains(*f)) {
                index.invalidate_file(file);
            }
        }

        let source = Arc::clone(&ctx.files);
        let repo_id = ctx.repo_id.clone();
        let cancellation = ctx.cancellation.clone();
        let scanned: Vec<(PathBuf, FileImports)> = tokio::task::spawn_blocking(move || {
            files_to_process
                .par_iter()
                .filter(|_| !cancellation.is_cancelled())
                .map(|file| (file.clone(), scan_file(source.as_ref(), &repo_id, file, &known)))
                .collect()
        })
        .await
        .map_err(|e| StageError::transient(format!("import scan task failed: {}", e)))?;

        if ctx.cancellation.is_cancelled() {
            return Err(StageError::transient("import scan cancelled"));
        }

        let mut edges_recorded = 0;
        for (file, imports) in &scanned {
            index.invalidate_file(file);
            for target in &imports.resolved {
                index.record_import(file.clone(), target.clone());
                edges_recorded += 1;
            }
            for error in &imports.errors {
                warn!("Import scan {}: {}", file.display(), error);
                warnings.push(format!("{}: {}", file.display(), error));
            }
        }

        let files_processed = scanned.len();
        let mut files = previous.map(|p| p.files).unwrap_or_default();
        files.retain(|path, _| present.contains(path));
        files.extend(scanned);

        let output = ImportScanOutput { files };
        let data = serde_json::to_vec(&output).map_err(StageError::permanent)?;

        debug!(
            "Import scan recorded {} edges, index holds {}",
            edges_recorded,
            index.edge_count()
        );

        Ok(StageOutput {
            data,
            metrics: StageMetrics {
                files_processed,
                items_created: edges_recorded,
                duration_ms: start.elapsed().as_millis() as u64,
                attempts: 0,
                warnings,
            },
        })
    }
}
