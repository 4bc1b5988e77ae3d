use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{Cli, DEFAULT_MODEL, GenerationArgs};
use crate::dotnet::Dotnet;
use crate::extractor::{Extractor, ensure_extractor_tool};
use crate::generator::{OllamaGenerator, PromptOptions};
use crate::orchestrator::PipelineSettings;

pub const ENV_EXTRACTOR: &str = "TESTGEN_EXTRACTOR";
pub const ENV_DOTNET: &str = "TESTGEN_DOTNET";
pub const ENV_GENERATOR: &str = "TESTGEN_GENERATOR";
pub const ENV_GIT: &str = "TESTGEN_GIT";
pub const ENV_REPORTGENERATOR: &str = "TESTGEN_REPORTGENERATOR";
pub const ENV_MODEL: &str = "TESTGEN_MODEL";

pub fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.db.clone() {
        return Ok(p);
    }

    Ok(testgen_home()?.join("cache.lmdb"))
}

/// Flag, then environment variable, then `default` looked up on `PATH`.
pub fn resolve_program(flag: Option<&Path>, env_var: &str, default: &str) -> PathBuf {
    if let Some(p) = flag {
        return p.to_path_buf();
    }
    match env::var(env_var) {
        Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => PathBuf::from(default),
    }
}

pub fn resolve_model(cli: &Cli) -> String {
    if let Some(m) = cli.model.clone() {
        return m;
    }
    match env::var(ENV_MODEL) {
        Ok(m) if !m.trim().is_empty() => m,
        _ => DEFAULT_MODEL.to_string(),
    }
}

pub fn resolve_dotnet(cli: &Cli) -> Dotnet {
    Dotnet::new(resolve_program(cli.dotnet.as_deref(), ENV_DOTNET, "dotnet"))
}

pub fn resolve_generator(cli: &Cli, args: &GenerationArgs) -> OllamaGenerator {
    OllamaGenerator::new(
        resolve_program(cli.generator_bin.as_deref(), ENV_GENERATOR, "ollama"),
        Duration::from_secs(args.timeout_secs.max(1)),
    )
}

pub fn resolve_git(cli: &Cli) -> PathBuf {
    resolve_program(cli.git.as_deref(), ENV_GIT, "git")
}

pub fn resolve_reportgenerator(cli: &Cli) -> PathBuf {
    resolve_program(cli.reportgenerator.as_deref(), ENV_REPORTGENERATOR, "reportgenerator")
}

/// An explicit extractor wins; a `.dll` runs through dotnet. Otherwise the
/// bundled Roslyn tool is built under `tools_dir` on first use.
pub fn resolve_extractor(cli: &Cli, dotnet: &Dotnet, tools_dir: &Path) -> Result<Extractor> {
    let explicit = cli.extractor.clone().or_else(|| {
        env::var(ENV_EXTRACTOR)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
    });

    let Some(path) = explicit else {
        let dll = ensure_extractor_tool(dotnet, tools_dir)?;
        return Ok(Extractor::dotnet(dotnet, &dll));
    };

    let is_dll = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"));
    if is_dll {
        Ok(Extractor::dotnet(dotnet, &path))
    } else {
        Ok(Extractor::new(path))
    }
}

pub fn pipeline_settings(cli: &Cli, args: &GenerationArgs) -> Result<PipelineSettings> {
    let few_shot = match &args.few_shot {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read few-shot example: {}", path.display()))?,
        ),
        None => None,
    };

    Ok(PipelineSettings {
        model: resolve_model(cli),
        force_regenerate: args.force,
        prompt: PromptOptions {
            test_namespace: args.project_name.clone(),
            few_shot,
        },
    })
}

pub fn clear_db(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path, "db")?;
    remove_file_if_exists(&lmdb_lock_path(db_path), "db lock")?;
    Ok(())
}

fn testgen_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("testgen"))
}

fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}
