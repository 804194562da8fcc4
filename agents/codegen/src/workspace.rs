//! Projects living under the configured workspace directories.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

use taskrelay::process;
use taskrelay::protocol::DirNode;

pub const DEFAULT_TREE_DEPTH: usize = 5;

const SKIPPED_DIRS: [&str; 3] = ["node_modules", "__pycache__", "vendor"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("project name is empty")]
    EmptyName,
    #[error("invalid project name: {0}")]
    InvalidName(String),
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("project already exists: {0}")]
    Exists(String),
    #[error("no workspace configured")]
    NoWorkspace,
    #[error("invalid file path")]
    InvalidPath,
}

/// A project name is a single path segment.
pub fn validate_name(name: &str) -> Result<(), ResolveError> {
    if name.is_empty() {
        return Err(ResolveError::EmptyName);
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(ResolveError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Workspaces {
    roots: Vec<PathBuf>,
}

impl Workspaces {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Existing project directory, searching workspaces in order.
    pub fn find(&self, name: &str) -> Result<Option<PathBuf>, ResolveError> {
        validate_name(name)?;
        Ok(self
            .roots
            .iter()
            .map(|ws| ws.join(name))
            .find(|p| p.is_dir()))
    }

    fn existing(&self, name: &str) -> Result<PathBuf, ResolveError> {
        self.find(name)?
            .ok_or_else(|| ResolveError::NotFound(name.to_string()))
    }

    /// Project directory for a task: found, or created under the first
    /// workspace. Either way it ends up with its own git repository.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf> {
        let path = match self.find(name)? {
            Some(path) => path,
            None => {
                let root = self.roots.first().ok_or(ResolveError::NoWorkspace)?;
                let path = root.join(name);
                tokio::fs::create_dir_all(&path)
                    .await
                    .with_context(|| format!("create project dir {}", path.display()))?;
                path
            }
        };
        process::ensure_git_repo(&path).await;
        Ok(path)
    }

    /// Create a new project under the first workspace.
    pub async fn create(&self, name: &str) -> Result<PathBuf> {
        if self.find(name)?.is_some() {
            return Err(ResolveError::Exists(name.to_string()).into());
        }
        let root = self.roots.first().ok_or(ResolveError::NoWorkspace)?;
        let path = root.join(name);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("create dir failed: {}", path.display()))?;
        process::ensure_git_repo(&path).await;
        tracing::info!(project = %name, path = %path.display(), "project created");
        Ok(path)
    }

    /// Names of all projects across workspaces, deduplicated and sorted.
    pub fn scan(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .roots
            .iter()
            .filter_map(|ws| std::fs::read_dir(ws).ok())
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Contents of `path` inside a project. Paths that would leave the
    /// project are refused.
    pub async fn read_file(&self, project: &str, path: &str) -> Result<String> {
        let root = self.existing(project)?;
        let full = confine(&root, path)?;
        let data = tokio::fs::read(&full)
            .await
            .with_context(|| format!("read {}", path))?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub async fn tree(&self, project: &str, max_depth: usize) -> Result<DirNode> {
        let root = self.existing(project)?;
        let rel = project.to_string();
        tokio::task::spawn_blocking(move || build_tree(&root, &rel, 0, max_depth))
            .await
            .context("tree walk panicked")?
            .with_context(|| format!("read tree of {}", project))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn confine(root: &Path, rel: &str) -> Result<PathBuf, ResolveError> {
    let root = normalize(root);
    let full = normalize(&root.join(rel));
    if !full.starts_with(&root) {
        return Err(ResolveError::InvalidPath);
    }
    Ok(full)
}

fn build_tree(abs: &Path, rel: &str, depth: usize, max_depth: usize) -> Option<DirNode> {
    let meta = std::fs::metadata(abs).ok()?;
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| rel.to_string());

    let mut node = DirNode {
        name,
        path: rel.to_string(),
        is_dir: meta.is_dir(),
        size: None,
        children: Vec::new(),
    };

    if !meta.is_dir() {
        node.size = Some(meta.len());
        return Some(node);
    }
    if depth >= max_depth {
        return Some(node);
    }

    let Ok(entries) = std::fs::read_dir(abs) else {
        return Some(node);
    };
    for entry in entries.flatten() {
        let child_name = entry.file_name().to_string_lossy().into_owned();
        if child_name.starts_with('.') || SKIPPED_DIRS.contains(&child_name.as_str()) {
            continue;
        }
        let child_rel = format!("{}/{}", rel, child_name);
        if let Some(child) = build_tree(&entry.path(), &child_rel, depth + 1, max_depth) {
            node.children.push(child);
        }
    }

    // Directories first, then by name
    node.children
        .sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, tempfile::TempDir, Workspaces) {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let ws = Workspaces::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
        (first, second, ws)
    }

    #[test]
    fn test_rejects_traversal_names() {
        for name in ["..", "a/b", "a\\b", "x..y"] {
            assert_eq!(
                validate_name(name),
                Err(ResolveError::InvalidName(name.to_string()))
            );
        }
        assert_eq!(validate_name(""), Err(ResolveError::EmptyName));
        assert_eq!(validate_name("proj1"), Ok(()));
    }

    #[tokio::test]
    async fn test_resolve_prefers_existing_then_creates_in_first() {
        let (first, second, ws) = fixture();
        fs::create_dir_all(second.path().join("old").join(".git")).unwrap();

        let found = ws.resolve("old").await.unwrap();
        assert_eq!(found, second.path().join("old"));

        let created = ws.resolve("fresh").await.unwrap();
        assert_eq!(created, first.path().join("fresh"));
        assert!(created.is_dir());
    }

    #[tokio::test]
    async fn test_resolve_refuses_bad_name() {
        let (_first, _second, ws) = fixture();
        let err = ws.resolve("../etc").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ResolveError>(),
            Some(&ResolveError::InvalidName("../etc".to_string()))
        );
    }

    #[tokio::test]
    async fn test_create_refuses_existing() {
        let (first, _second, ws) = fixture();
        fs::create_dir(first.path().join("taken")).unwrap();
        let err = ws.create("taken").await.unwrap_err();
        assert_eq!(err.to_string(), "project already exists: taken");
    }

    #[test]
    fn test_scan_dedups_and_skips_hidden() {
        let (first, second, ws) = fixture();
        fs::create_dir(first.path().join("b")).unwrap();
        fs::create_dir(first.path().join(".hidden")).unwrap();
        fs::create_dir(second.path().join("a")).unwrap();
        fs::create_dir(second.path().join("b")).unwrap();
        fs::write(second.path().join("file.txt"), "x").unwrap();
        assert_eq!(ws.scan(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_read_file_confined_to_project() {
        let (first, _second, ws) = fixture();
        let proj = first.path().join("p");
        fs::create_dir_all(proj.join("src")).unwrap();
        fs::write(proj.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(first.path().join("secret"), "nope").unwrap();

        assert_eq!(ws.read_file("p", "src/main.rs").await.unwrap(), "fn main() {}");
        assert_eq!(ws.read_file("p", "./src/../src/main.rs").await.unwrap(), "fn main() {}");

        let err = ws.read_file("p", "../secret").await.unwrap_err();
        assert_eq!(err.to_string(), "invalid file path");

        let err = ws.read_file("missing", "a").await.unwrap_err();
        assert_eq!(err.to_string(), "project not found: missing");
    }

    #[tokio::test]
    async fn test_tree_order_and_filters() {
        let (first, _second, ws) = fixture();
        let proj = first.path().join("p");
        fs::create_dir_all(proj.join("src/deep")).unwrap();
        fs::create_dir_all(proj.join("node_modules/x")).unwrap();
        fs::create_dir_all(proj.join(".git")).unwrap();
        fs::write(proj.join("b.txt"), "hello").unwrap();
        fs::write(proj.join("a.txt"), "").unwrap();
        fs::write(proj.join("src/deep/x.rs"), "").unwrap();

        let tree = ws.tree("p", DEFAULT_TREE_DEPTH).await.unwrap();
        assert_eq!(tree.name, "p");
        assert_eq!(tree.path, "p");
        let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["src", "a.txt", "b.txt"]);
        assert_eq!(tree.children[2].size, Some(5));
        assert_eq!(tree.children[0].children[0].path, "p/src/deep");

        let shallow = ws.tree("p", 1).await.unwrap();
        assert!(shallow.children[0].children.is_empty());
    }
}
