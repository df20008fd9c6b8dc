//! Repository file enumeration
//!
//! Paths handed to stages are repository-relative.

use crate::config::FileConfig;
use crate::error::{OrchestratorError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Source of the files that make up a repository snapshot
pub trait FileSource: Send + Sync {
    /// Sorted, repository-relative paths
    fn list_files(&self, repo_id: &str, snapshot_id: &str) -> Result<Vec<PathBuf>>;

    fn read_to_string(&self, repo_id: &str, path: &Path) -> Result<String>;
}

/// Working-tree checkout per repository
#[derive(Debug, Clone, Default)]
pub struct DirectoryFileSource {
    roots: HashMap<String, PathBuf>,
    files: FileConfig,
}

impl DirectoryFileSource {
    pub fn new(files: FileConfig) -> Self {
        Self {
            roots: HashMap::new(),
            files,
        }
    }

    pub fn with_repository(mut self, repo_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(repo_id.into(), root.into());
        self
    }

    fn root(&self, repo_id: &str) -> Result<&Path> {
        self.roots
            .get(repo_id)
            .map(PathBuf::as_path)
            .ok_or_else(|| OrchestratorError::Other(anyhow::anyhow!("unknown repository {}", repo_id)))
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

impl FileSource for DirectoryFileSource {
    fn list_files(&self, repo_id: &str, _snapshot_id: &str) -> Result<Vec<PathBuf>> {
        let root = self.root(repo_id)?;
        let mut files = Vec::new();

        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| !is_hidden(e)) {
            let entry = entry.map_err(|e| OrchestratorError::Other(e.into()))?;
            if !entry.file_type().is_file() || !self.files.matches(entry.path()) {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }

        files.sort();
        Ok(files)
    }

    fn read_to_string(&self, repo_id: &str, path: &Path) -> Result<String> {
        let root = self.root(repo_id)?;
        Ok(std::fs::read_to_string(root.join(path))?)
    }
}

/// In-memory file contents per repository
#[derive(Debug, Default)]
pub struct StaticFileSource {
    repos: RwLock<HashMap<String, BTreeMap<PathBuf, String>>>,
}

impl StaticFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(
        self,
        repo_id: impl Into<String>,
        path: impl Into<PathBuf>,
        contents: impl Into<String>,
    ) -> Self {
        self.set_file(repo_id, path, contents);
        self
    }

    pub fn set_file(
        &self,
        repo_id: impl Into<String>,
        path: impl Into<PathBuf>,
        contents: impl Into<String>,
    ) {
        self.repos
            .write()
            .entry(repo_id.into())
            .or_default()
            .insert(path.into(), contents.into());
    }

    pub fn remove_file(&self, repo_id: &str, path: &Path) -> bool {
        self.repos
            .write()
            .get_mut(repo_id)
            .map(|files| files.remove(path).is_some())
            .unwrap_or(false)
    }
}

impl FileSource for StaticFileSource {
    fn list_files(&self, repo_id: &str, _snapshot_id: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .repos
            .read()
            .get(repo_id)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn read_to_string(&self, repo_id: &str, path: &Path) -> Result<String> {
        self.repos
            .read()
            .get(repo_id)
            .and_then(|files| files.get(path).cloned())
            .ok_or_else(|| {
                OrchestratorError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{}: {}", repo_id, path.display()),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_source_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("pkg")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("pkg/b.py"), "import a").unwrap();
        std::fs::write(root.join("a.py"), "").unwrap();
        std::fs::write(root.join("README.md"), "").unwrap();
        std::fs::write(root.join(".git/config.py"), "").unwrap();

        let source = DirectoryFileSource::new(FileConfig::default()).with_repository("repo", root);
        let files = source.list_files("repo", "snap").unwrap();

        assert_eq!(files, vec![PathBuf::from("a.py"), PathBuf::from("pkg/b.py")]);
        assert_eq!(
            source.read_to_string("repo", Path::new("pkg/b.py")).unwrap(),
            "import a"
        );
    }

    #[test]
    fn test_directory_source_unknown_repo() {
        let source = DirectoryFileSource::new(FileConfig::default());
        assert!(source.list_files("nope", "snap").is_err());
    }

    #[test]
    fn test_static_source() {
        let source = StaticFileSource::new()
            .with_file("repo", "b.py", "import a")
            .with_file("repo", "a.py", "");

        assert_eq!(
            source.list_files("repo", "s").unwrap(),
            vec![PathBuf::from("a.py"), PathBuf::from("b.py")]
        );
        assert!(source.remove_file("repo", Path::new("a.py")));
        assert!(source.read_to_string("repo", Path::new("a.py")).is_err());
        assert!(source.list_files("other", "s").unwrap().is_empty());
    }
}
