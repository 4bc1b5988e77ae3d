use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::generator::DEFAULT_TIMEOUT_SECS;

pub const DEFAULT_MODEL: &str = "qwen2.5:7b";
pub const DEFAULT_TEST_PROJECT: &str = "GeneratedTests";

#[derive(Debug, Clone, Parser)]
#[command(name = "testgen")]
#[command(about = "Generate NUnit test classes for a C# code base with a local language model")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Generation cache file.
    #[arg(long, value_name = "FILE", global = true)]
    pub db: Option<PathBuf>,

    /// Structural extractor: an executable, or a `.dll` run through dotnet.
    #[arg(long, value_name = "FILE", global = true)]
    pub extractor: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true)]
    pub dotnet: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true)]
    pub generator_bin: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true)]
    pub git: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true)]
    pub reportgenerator: Option<PathBuf>,

    /// Model identifier; part of every cache entry.
    #[arg(short = 'm', long, value_name = "NAME", global = true)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Clone a repository, generate tests, then build and measure coverage.
    Run {
        #[arg(long, value_name = "URL")]
        repo: String,

        #[arg(long, value_name = "NAME", default_value = "main")]
        branch: String,

        #[arg(short = 'o', long, value_name = "DIR", default_value = "output")]
        output: PathBuf,

        /// Stop after writing the tests: no restore, build, test or report.
        #[arg(long)]
        no_verify: bool,

        #[command(flatten)]
        generation: GenerationArgs,
    },
    /// Generate tests for a local source tree.
    Generate {
        #[arg(short = 's', long, value_name = "DIR")]
        source: PathBuf,

        /// Directory that receives the test project; defaults to the source
        /// directory's parent.
        #[arg(short = 'o', long, value_name = "DIR")]
        output: Option<PathBuf>,

        #[command(flatten)]
        generation: GenerationArgs,
    },
    Stats,
    Clear,
}

#[derive(Debug, Clone, Args)]
pub struct GenerationArgs {
    #[arg(short = 'j', long, value_name = "N", default_value_t = 1)]
    pub workers: usize,

    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    #[arg(long, value_name = "NAME", default_value = DEFAULT_TEST_PROJECT)]
    pub project_name: String,

    /// Ignore cached artifacts; fresh results are still cached.
    #[arg(long)]
    pub force: bool,

    /// Log what would be written without touching the test project.
    #[arg(long)]
    pub dry_run: bool,

    /// Example test class prepended to every prompt.
    #[arg(long, value_name = "FILE")]
    pub few_shot: Option<PathBuf>,

    /// Extra directory names to skip while scanning sources.
    #[arg(long = "exclude", value_name = "DIR")]
    pub exclude: Vec<String>,
}
