/// Integration tests for incremental update functionality
///
/// The built-in import scan stage maintains the reverse dependency index;
/// a downstream stage must only see the affected files.
mod common;

use common::{stage, Recorder};
use codegraph_orchestrator::{
    compute_affected_files, CacheKey, DirectoryFileSource, HandlerRegistry, ImportScanOutput,
    ImportScanStage, JobRequest, JobStatus, Orchestrator, OrchestratorConfig,
    ReverseDependencyIndex, StageId, INDEX_STAGE,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// app.py → pkg/services.py → pkg/models.py; cli.py imports nothing local
fn sample_repo(root: &Path) {
    write(root, "pkg/__init__.py", "");
    write(root, "pkg/models.py", "import os\n\nclass User:\n    pass\n");
    write(root, "pkg/services.py", "from pkg import models\n");
    write(root, "app.py", "from pkg.services import run\n");
    write(root, "cli.py", "import sys\n");
}

fn paths(files: &[&str]) -> Vec<PathBuf> {
    files.iter().map(PathBuf::from).collect()
}

async fn open(storage: &Path, repo: &Path, rec: &Recorder) -> Orchestrator {
    let config = OrchestratorConfig::with_storage_root(storage)
        .stages(vec![stage("ir", &[]), stage("chunks", &["ir"])]);
    let handlers = HandlerRegistry::new()
        .with(ImportScanStage::new())
        .unwrap()
        .with(rec.stage("chunks"))
        .unwrap();
    let files = DirectoryFileSource::new(config.files.clone()).with_repository("repo", repo);
    Orchestrator::open(config, handlers, Arc::new(files)).await.unwrap()
}

#[tokio::test]
async fn test_incremental_run_restricts_work_to_affected_files() {
    let storage = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    sample_repo(repo.path());
    let rec = Recorder::new();
    let orch = open(storage.path(), repo.path(), &rec).await;

    let full = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
    let result = orch.run_job(full).await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(rec.processed("chunks").len(), 5);

    // models.py changes
    write(repo.path(), "pkg/models.py", "class User:\n    name = ''\n");
    let request = JobRequest::incremental("repo", "s2", paths(&["pkg/models.py"]), "s1");
    let id = orch.submit(request).await.unwrap();
    let result = orch.run_job(id).await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.affected_files, Some(3));
    assert_eq!(
        rec.processed("chunks"),
        paths(&["app.py", "pkg/models.py", "pkg/services.py"])
    );
    assert_eq!(result.stage_metrics[&StageId::IR].files_processed, 3);

    // the merged scan output still covers every file
    let ir = orch
        .store()
        .read(&CacheKey::new(StageId::IR, "repo", "s2"))
        .await
        .unwrap()
        .unwrap();
    let output = ImportScanOutput::from_bytes(&ir).unwrap();
    assert_eq!(output.files.len(), 5);
    assert!(output.files[Path::new("pkg/models.py")].resolved.is_empty());
    assert_eq!(
        output.files[Path::new("app.py")].resolved,
        paths(&["pkg/services.py"])
    );
}

#[tokio::test]
async fn test_index_survives_restart_via_checkpoint() {
    let storage = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    sample_repo(repo.path());

    {
        let rec = Recorder::new();
        let orch = open(storage.path(), repo.path(), &rec).await;
        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        orch.run_job(id).await.unwrap();
        assert!(orch
            .store()
            .is_valid(&CacheKey::new(INDEX_STAGE, "repo", "s1"))
            .await);
    }

    let rec = Recorder::new();
    let orch = open(storage.path(), repo.path(), &rec).await;
    orch.recover().await.unwrap();
    assert!(orch.indexes().get("repo").is_none());

    let request = JobRequest::incremental("repo", "s2", paths(&["pkg/services.py"]), "s1");
    let id = orch.submit(request).await.unwrap();
    let result = orch.run_job(id).await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.affected_files, Some(2));
    assert_eq!(rec.processed("chunks"), paths(&["app.py", "pkg/services.py"]));
    assert!(orch.indexes().get("repo").is_some());
}

#[tokio::test]
async fn test_new_import_is_picked_up_incrementally() {
    let storage = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    sample_repo(repo.path());
    let rec = Recorder::new();
    let orch = open(storage.path(), repo.path(), &rec).await;

    let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
    orch.run_job(id).await.unwrap();

    // cli.py starts importing app.py
    write(repo.path(), "cli.py", "import app\n");
    let request = JobRequest::incremental("repo", "s2", paths(&["cli.py"]), "s1");
    let id = orch.submit(request).await.unwrap();
    orch.run_job(id).await.unwrap();

    // a later change to models.py now reaches cli.py too
    let index = orch.indexes().get("repo").unwrap();
    let affected = index.compute_affected(paths(&["pkg/models.py"]));
    let expected: HashSet<PathBuf> =
        paths(&["app.py", "cli.py", "pkg/models.py", "pkg/services.py"])
            .into_iter()
            .collect();
    assert_eq!(affected, expected);
}

#[test]
fn test_bfs_scenario_chain() {
    let index = ReverseDependencyIndex::new();
    index.record_import("file2", "file1");
    index.record_import("file3", "file2");

    let changed = HashSet::from([PathBuf::from("file1")]);
    let affected = compute_affected_files(&changed, &index);

    let expected: HashSet<PathBuf> = paths(&["file1", "file2", "file3"]).into_iter().collect();
    assert_eq!(affected, expected);
}

#[test]
fn test_bfs_diamond_dependency() {
    let index = ReverseDependencyIndex::new();

    //     base.py
    //    /       \
    // left.py  right.py
    //    \       /
    //     top.py
    index.record_import("left.py", "base.py");
    index.record_import("right.py", "base.py");
    index.record_import("top.py", "left.py");
    index.record_import("top.py", "right.py");

    let affected = index.compute_affected([PathBuf::from("base.py")]);
    assert_eq!(affected.len(), 4);
}

#[test]
fn test_bfs_circular_dependency() {
    let index = ReverseDependencyIndex::new();
    index.record_import("a.py", "b.py");
    index.record_import("b.py", "a.py");

    let affected = index.compute_affected([PathBuf::from("a.py")]);
    assert_eq!(affected.len(), 2);
}
