use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

const PREVIEW_CHARS: usize = 200;

/// Where a generated artifact landed, or would have in dry-run mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub written: bool,
}

/// Writes generated tests into the test project, mirroring each source
/// file's directory relative to the source root.
#[derive(Debug, Clone)]
pub struct OutputSink {
    project_dir: PathBuf,
    source_root: PathBuf,
    dry_run: bool,
}

impl OutputSink {
    pub fn new(project_dir: PathBuf, source_root: PathBuf, dry_run: bool) -> Self {
        Self {
            project_dir,
            source_root,
            dry_run,
        }
    }

    /// `<project>/<rel dir>/<Stem>Tests.cs` for the first class of a file;
    /// later classes of the same file get `<Stem>.<Class>Tests.cs` so they do
    /// not overwrite each other.
    pub fn destination(&self, source_file: &Path, class_name: &str, ordinal: usize) -> PathBuf {
        let rel = source_file
            .strip_prefix(&self.source_root)
            .unwrap_or(source_file);
        let dest_dir = match rel.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && rel != source_file => {
                self.project_dir.join(parent)
            }
            _ => self.project_dir.clone(),
        };

        let stem = source_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| class_name.to_string());
        let file_name = if ordinal == 0 {
            format!("{stem}Tests.cs")
        } else {
            format!("{stem}.{class_name}Tests.cs")
        };
        dest_dir.join(file_name)
    }

    pub fn write(
        &self,
        source_file: &Path,
        class_name: &str,
        ordinal: usize,
        artifact: &str,
    ) -> Result<WriteOutcome> {
        let dest = self.destination(source_file, class_name, ordinal);

        if self.dry_run {
            let preview: String = artifact.chars().take(PREVIEW_CHARS).collect();
            info!(
                path = %dest.display(),
                chars = artifact.chars().count(),
                "[DRY RUN] would write test file"
            );
            info!("[DRY RUN] preview:\n{}…", preview.trim_end());
            return Ok(WriteOutcome {
                path: dest,
                written: false,
            });
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&dest, artifact)
            .with_context(|| format!("Failed to write test file: {}", dest.display()))?;
        info!(path = %dest.display(), "wrote test file");

        Ok(WriteOutcome {
            path: dest,
            written: true,
        })
    }
}
