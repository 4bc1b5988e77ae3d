use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, mpsc};

pub const SOURCE_EXTENSION: &str = "cs";
pub const DEFAULT_EXCLUDED_DIRS: [&str; 3] = ["bin", "obj", ".git"];

/// Directory names skipped while enumerating sources.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    extension: String,
    excluded_dirs: Vec<String>,
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self {
            extension: SOURCE_EXTENSION.to_string(),
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl SourceFilter {
    pub fn with_excluded_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dir in dirs {
            let dir = dir.into();
            if !self.excluded_dirs.contains(&dir) {
                self.excluded_dirs.push(dir);
            }
        }
        self
    }

    fn skips_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.excluded_dirs.iter().any(|d| d == name)
    }
}

/// Lists source files under `root` in lexicographic path order.
///
/// The order matters: registry merging and fallback scans both break ties by
/// enumeration order, so it has to be stable across runs.
pub fn find_source_files(root: &Path, filter: &SourceFilter) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        anyhow::bail!("Source directory not found: {}", root.display());
    }

    let (tx, rx) = mpsc::channel();
    let dir_filter = Arc::new(filter.clone());
    let root_owned = root.to_path_buf();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            if !is_dir || entry.path() == root_owned {
                return true;
            }
            !dir_filter.skips_dir(&entry.file_name().to_string_lossy())
        })
        .build_parallel();

    let extension = filter.extension.clone();
    walker.run(|| {
        let tx = tx.clone();
        let extension = extension.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                let is_file = entry.file_type().is_some_and(|t| t.is_file());
                if is_file && path.extension().is_some_and(|e| e == extension.as_str()) {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files: Vec<PathBuf> = rx.iter().collect();
    files.sort();
    Ok(files)
}

/// `/`-separated path of `path` relative to `root`, used in cache keys.
pub fn relative_key(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn cache_key(relative_path: &str, class_name: &str) -> String {
    format!("{relative_path}::{class_name}")
}
