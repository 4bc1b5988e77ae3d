//! `dotnet` CLI integration: test-project scaffolding, solution wiring,
//! build and coverage reporting around the generated tests.

use anyhow::{Context, Result, bail};
use ignore::WalkBuilder;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};
use tracing::info;

pub const TARGET_FRAMEWORK: &str = "net8.0";

/// Packages pinned into the generated NUnit project.
pub const NUNIT_PACKAGES: [(&str, &str); 4] = [
    ("NUnit", "4.1.0"),
    ("NUnit3TestAdapter", "4.5.0"),
    ("Microsoft.NET.Test.Sdk", "17.9.0"),
    ("Moq", "4.20.70"),
];

#[derive(Debug, Clone)]
pub struct Dotnet {
    program: PathBuf,
}

impl Dotnet {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs `dotnet <args>` and fails with its stderr on a non-zero exit.
    pub fn run<I, S>(&self, args: I, cwd: Option<&Path>) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd.output().with_context(|| {
            format!(
                "Failed to execute {} (ensure the .NET SDK is installed)",
                self.program.display()
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            bail!(
                "dotnet command failed ({}): {}",
                output.status,
                if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() }
            );
        }
        Ok(output)
    }

    /// Scaffolds `<base_dir>/<name>` as an NUnit project unless its `.csproj`
    /// already exists. Returns the project directory.
    pub fn init_nunit_project(&self, base_dir: &Path, name: &str) -> Result<PathBuf> {
        let project_dir = base_dir.join(name);
        let csproj = project_dir.join(format!("{name}.csproj"));
        if csproj.is_file() {
            return Ok(project_dir);
        }

        std::fs::create_dir_all(&project_dir)
            .with_context(|| format!("Failed to create directory: {}", project_dir.display()))?;
        self.run(
            [
                OsStr::new("new"),
                OsStr::new("nunit"),
                OsStr::new("-n"),
                OsStr::new(name),
                OsStr::new("-f"),
                OsStr::new(TARGET_FRAMEWORK),
                OsStr::new("-o"),
                project_dir.as_os_str(),
            ],
            None,
        )?;

        for (package, version) in NUNIT_PACKAGES {
            self.run(
                [
                    OsStr::new("add"),
                    csproj.as_os_str(),
                    OsStr::new("package"),
                    OsStr::new(package),
                    OsStr::new("--version"),
                    OsStr::new(version),
                ],
                None,
            )?;
        }

        info!(project = %project_dir.display(), "scaffolded NUnit project");
        Ok(project_dir)
    }

    /// Creates (or overwrites) `<base_dir>/<name>.sln` containing `projects`.
    pub fn create_solution(
        &self,
        base_dir: &Path,
        name: &str,
        projects: &[&Path],
    ) -> Result<PathBuf> {
        let sln = base_dir.join(format!("{name}.sln"));
        self.run(["new", "sln", "-n", name, "--force"], Some(base_dir))?;

        for project in projects {
            let rel = relative_path(base_dir, project);
            self.run(
                [
                    OsStr::new("sln"),
                    sln.as_os_str(),
                    OsStr::new("add"),
                    rel.as_os_str(),
                ],
                Some(base_dir),
            )?;
        }
        Ok(sln)
    }

    pub fn restore_and_build(&self, sln: &Path) -> Result<()> {
        let cwd = sln.parent();
        info!(solution = %sln.display(), "restoring solution");
        self.run([OsStr::new("restore"), sln.as_os_str()], cwd)
            .context("dotnet restore failed")?;

        info!(solution = %sln.display(), "building solution");
        self.run(
            [OsStr::new("build"), sln.as_os_str(), OsStr::new("-c"), OsStr::new("Release")],
            cwd,
        )
        .context("Solution build failed")?;
        Ok(())
    }

    /// Runs the solution's tests collecting Cobertura coverage into `results_dir`.
    pub fn test_with_coverage(&self, sln: &Path, results_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(results_dir)
            .with_context(|| format!("Failed to create directory: {}", results_dir.display()))?;
        info!(solution = %sln.display(), "running tests with coverage collection");
        self.run(
            [
                OsStr::new("test"),
                sln.as_os_str(),
                OsStr::new("--collect:XPlat Code Coverage"),
                OsStr::new("--results-directory"),
                results_dir.as_os_str(),
                OsStr::new("-c"),
                OsStr::new("Release"),
            ],
            sln.parent(),
        )
        .context("dotnet test failed")?;
        Ok(())
    }
}

/// Renders an HTML coverage report with `reportgenerator`.
pub fn generate_report(reportgenerator: &Path, cobertura: &Path, target_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(target_dir)
        .with_context(|| format!("Failed to create directory: {}", target_dir.display()))?;
    let output = Command::new(reportgenerator)
        .arg(format!("-reports:{}", cobertura.display()))
        .arg(format!("-targetdir:{}", target_dir.display()))
        .arg("-reporttypes:Html")
        .output()
        .with_context(|| format!("Failed to execute {}", reportgenerator.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("ReportGenerator failed: {}", stderr.trim());
    }
    info!(report = %target_dir.display(), "HTML coverage report generated");
    Ok(())
}

/// First `.csproj` (in path order) whose file name does not mention tests.
pub fn find_project_file(src_dir: &Path) -> Option<PathBuf> {
    find_files(src_dir, |name| {
        let lower = name.to_ascii_lowercase();
        lower.ends_with(".csproj") && !lower.contains("test")
    })
    .into_iter()
    .next()
}

pub fn find_coverage_file(results_dir: &Path) -> Option<PathBuf> {
    find_files(results_dir, |name| name.ends_with(".cobertura.xml"))
        .into_iter()
        .next()
}

fn find_files(root: &Path, matches: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter(|entry| matches(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}

/// Adds a `<ProjectReference>` to `original_csproj` inside `test_csproj`.
/// Returns `false` when the reference was already present.
pub fn add_project_reference(test_csproj: &Path, original_csproj: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(test_csproj)
        .with_context(|| format!("Failed to read project file: {}", test_csproj.display()))?;

    let test_dir = test_csproj.parent().unwrap_or(Path::new("."));
    let include = relative_path(test_dir, original_csproj)
        .to_string_lossy()
        .to_string();
    let updated = insert_project_reference(&content, &include)
        .with_context(|| format!("No </Project> element in {}", test_csproj.display()))?;

    let Some(updated) = updated else {
        return Ok(false);
    };
    std::fs::write(test_csproj, updated)
        .with_context(|| format!("Failed to write project file: {}", test_csproj.display()))?;
    info!(
        reference = %original_csproj.display(),
        project = %test_csproj.display(),
        "added ProjectReference"
    );
    Ok(true)
}

/// `Ok(None)` when `include` is already referenced.
fn insert_project_reference(content: &str, include: &str) -> Result<Option<String>> {
    let reference = format!("<ProjectReference Include=\"{include}\" />");
    if content.contains(&format!("<ProjectReference Include=\"{include}\"")) {
        return Ok(None);
    }

    let Some(end) = content.rfind("</Project>") else {
        bail!("malformed project file");
    };

    let mut out = String::with_capacity(content.len() + reference.len() + 64);
    out.push_str(content[..end].trim_end());
    out.push_str("\n\n  <ItemGroup>\n    ");
    out.push_str(&reference);
    out.push_str("\n  </ItemGroup>\n\n");
    out.push_str(&content[end..]);
    Ok(Some(out))
}

/// Path of `target` relative to the directory `from`. Both are expected to be
/// absolute or both relative to the same base.
pub fn relative_path(from: &Path, target: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = from
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &target[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const TEST_CSPROJ: &str = r#"<Project Sdk="Microsoft.NET.Sdk">

  <PropertyGroup>
    <TargetFramework>net8.0</TargetFramework>
  </PropertyGroup>

</Project>
"#;

    #[test]
    fn relative_path_walks_up_and_down() {
        let rel = relative_path(
            Path::new("/out/GeneratedTests"),
            Path::new("/out/src/Api/Api.csproj"),
        );
        assert_eq!(rel, PathBuf::from("../src/Api/Api.csproj"));
        assert_eq!(
            relative_path(Path::new("/out"), Path::new("/out/GeneratedTests/T.csproj")),
            PathBuf::from("GeneratedTests/T.csproj")
        );
    }

    #[test]
    fn add_project_reference_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let test_dir = dir.path().join("GeneratedTests");
        fs::create_dir_all(&test_dir)?;
        let test_csproj = test_dir.join("GeneratedTests.csproj");
        fs::write(&test_csproj, TEST_CSPROJ)?;
        let original = dir.path().join("src/Api/Api.csproj");

        assert!(add_project_reference(&test_csproj, &original)?);
        let content = fs::read_to_string(&test_csproj)?;
        assert!(content.contains("<ProjectReference Include=\"../src/Api/Api.csproj\" />"));
        assert!(content.trim_end().ends_with("</Project>"));

        assert!(!add_project_reference(&test_csproj, &original)?);
        let again = fs::read_to_string(&test_csproj)?;
        assert_eq!(again.matches("<ProjectReference").count(), 1);
        Ok(())
    }

    #[test]
    fn find_project_file_skips_test_projects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("Api.Tests"))?;
        fs::create_dir_all(root.join("Api"))?;
        fs::write(root.join("Api.Tests/Api.Tests.csproj"), TEST_CSPROJ)?;
        fs::write(root.join("Api/Api.csproj"), TEST_CSPROJ)?;

        assert_eq!(find_project_file(root), Some(root.join("Api/Api.csproj")));
        Ok(())
    }

    #[test]
    fn find_coverage_file_locates_cobertura_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("3f2a");
        fs::create_dir_all(&nested)?;
        fs::write(nested.join("coverage.cobertura.xml"), "<coverage/>")?;

        assert_eq!(
            find_coverage_file(dir.path()),
            Some(nested.join("coverage.cobertura.xml"))
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn run_surfaces_stderr_of_failed_command() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let fake = dir.path().join("dotnet");
        fs::write(&fake, "#!/bin/sh\necho \"boom from fake dotnet\" >&2\nexit 3\n")?;
        let mut perms = fs::metadata(&fake)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&fake, perms)?;

        let err = Dotnet::new(fake).run(["build"], None).unwrap_err().to_string();
        assert!(err.contains("dotnet command failed"));
        assert!(err.contains("boom from fake dotnet"));
        Ok(())
    }
}
