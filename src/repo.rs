//! Source repository retrieval via the `git` CLI.

use anyhow::{Context, Result, bail};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Git {
    program: PathBuf,
}

impl Git {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    fn run<I, S>(&self, args: I, cwd: Option<&Path>) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .context("Failed to execute git (ensure git is installed)")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git command failed: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn origin_url(&self, checkout: &Path) -> Option<String> {
        self.run(["remote", "get-url", "origin"], Some(checkout)).ok()
    }

    /// Makes `dir` a checkout of `url` at `branch`.
    ///
    /// An existing checkout of the same remote is updated in place; one of a
    /// different remote is replaced. A non-empty directory that is not a git
    /// checkout is left alone and reported as an error.
    pub fn fetch_repo(&self, url: &str, branch: &str, dir: &Path) -> Result<()> {
        if dir.join(".git").exists() {
            match self.origin_url(dir) {
                Some(origin) if same_remote(&origin, url) => {
                    info!(dir = %dir.display(), branch, "updating existing checkout");
                    self.run(["fetch", "--prune", "origin"], Some(dir))?;
                    self.run(["checkout", branch], Some(dir))?;
                    self.run(["pull", "--ff-only", "origin", branch], Some(dir))?;
                    return Ok(());
                }
                other => {
                    warn!(
                        dir = %dir.display(),
                        origin = other.as_deref().unwrap_or("<none>"),
                        "checkout points at a different remote; re-cloning"
                    );
                    std::fs::remove_dir_all(dir)
                        .with_context(|| format!("Failed to remove {}", dir.display()))?;
                }
            }
        } else if is_non_empty_dir(dir)? {
            bail!(
                "Refusing to clone into non-empty directory that is not a git checkout: {}",
                dir.display()
            );
        }

        if let Some(parent) = dir.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        info!(url, branch, dir = %dir.display(), "cloning repository");
        self.run(
            [
                OsStr::new("clone"),
                OsStr::new("--branch"),
                OsStr::new(branch),
                OsStr::new(url),
                dir.as_os_str(),
            ],
            None,
        )?;
        Ok(())
    }
}

fn same_remote(a: &str, b: &str) -> bool {
    let normalize = |s: &str| {
        s.trim()
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .to_string()
    };
    normalize(a) == normalize(b)
}

fn is_non_empty_dir(dir: &Path) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let mut entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    Ok(entries.next().is_some())
}
