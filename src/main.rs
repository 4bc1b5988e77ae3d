use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use testgen::cache::GenerationCache;
use testgen::cli::{Cli, Commands, GenerationArgs};
use testgen::config::{
    clear_db, pipeline_settings, resolve_db_path, resolve_dotnet, resolve_extractor,
    resolve_generator, resolve_git, resolve_reportgenerator,
};
use testgen::dotnet::{
    Dotnet, add_project_reference, find_coverage_file, find_project_file, generate_report,
};
use testgen::extractor::{ClassExtractor, EXTRACTOR_DIR_NAME};
use testgen::orchestrator::{Orchestrator, RunReport};
use testgen::repo::Git;
use testgen::scan::{SourceFilter, find_source_files};
use testgen::writer::OutputSink;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const COVERAGE_RESULTS_DIR: &str = "coverage_results";
const COVERAGE_REPORT_DIR: &str = "coverage-report";

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = resolve_db_path(&cli)?;
            clear_db(&db_path)?;
            info!(db = %db_path.display(), "cache cleared");
        }
        Commands::Stats => {
            let db_path = resolve_db_path(&cli)?;
            let cache = GenerationCache::open(db_path)?;
            let stats = cache.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Generate {
            source,
            output,
            generation,
        } => {
            let source = absolute_dir(&source)?;
            let output = match output {
                Some(dir) => ensure_dir(&dir)?,
                None => source.parent().map(Path::to_path_buf).unwrap_or_else(|| source.clone()),
            };
            let dotnet = resolve_dotnet(&cli);
            let extractor = resolve_extractor(&cli, &dotnet, &output)?;
            let project_dir = output.join(&generation.project_name);
            let report = generate_tests(&cli, &source, &project_dir, &extractor, &generation)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run {
            repo,
            branch,
            output,
            no_verify,
            generation,
        } => {
            let result = run_pipeline(&cli, &repo, &branch, &output, no_verify, &generation)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testgen=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[derive(Debug, Serialize)]
struct PipelineOutput {
    repo: String,
    branch: String,
    source_dir: String,
    project_file: String,
    test_project: String,
    solution: String,
    generation: RunReport,
    verification: Option<Verification>,
}

#[derive(Debug, Default, Serialize)]
struct Verification {
    built: bool,
    tested: bool,
    coverage_file: Option<String>,
    report_dir: Option<String>,
    error: Option<String>,
}

fn run_pipeline(
    cli: &Cli,
    repo: &str,
    branch: &str,
    output: &Path,
    no_verify: bool,
    args: &GenerationArgs,
) -> Result<PipelineOutput> {
    let output = ensure_dir(output)?;
    let src_dir = output.join("src");
    Git::new(resolve_git(cli)).fetch_repo(repo, branch, &src_dir)?;

    let project_file = find_project_file(&src_dir)
        .with_context(|| format!("No non-test .csproj found under {}", src_dir.display()))?;
    info!(project = %project_file.display(), "found project file");

    let dotnet = resolve_dotnet(cli);
    let extractor = resolve_extractor(cli, &dotnet, &output)?;
    let test_project_dir = dotnet.init_nunit_project(&output, &args.project_name)?;
    let test_csproj = test_project_dir.join(format!("{}.csproj", args.project_name));
    let solution = dotnet.create_solution(
        &output,
        &args.project_name,
        &[project_file.as_path(), test_csproj.as_path()],
    )?;

    let generation = generate_tests(cli, &src_dir, &test_project_dir, &extractor, args)?;
    add_project_reference(&test_csproj, &project_file)?;

    let verification = if no_verify || args.dry_run {
        info!("skipping build and coverage");
        None
    } else {
        Some(verify(&dotnet, &resolve_reportgenerator(cli), &solution, &output))
    };

    Ok(PipelineOutput {
        repo: repo.to_string(),
        branch: branch.to_string(),
        source_dir: src_dir.to_string_lossy().to_string(),
        project_file: project_file.to_string_lossy().to_string(),
        test_project: test_project_dir.to_string_lossy().to_string(),
        solution: solution.to_string_lossy().to_string(),
        generation,
        verification,
    })
}

fn generate_tests(
    cli: &Cli,
    source: &Path,
    project_dir: &Path,
    extractor: &dyn ClassExtractor,
    args: &GenerationArgs,
) -> Result<RunReport> {
    let filter = SourceFilter::default()
        .with_excluded_dirs([args.project_name.as_str(), EXTRACTOR_DIR_NAME])
        .with_excluded_dirs(args.exclude.iter().cloned());
    let files = find_source_files(source, &filter)?;
    info!(files = files.len(), source = %source.display(), "found source files");

    let settings = pipeline_settings(cli, args)?;
    let generator = resolve_generator(cli, args);
    let cache = GenerationCache::open(resolve_db_path(cli)?)?;
    info!(db = %cache.db_path().display(), model = %settings.model, "opened generation cache");
    let registry = Orchestrator::build_registry(&files, extractor, args.workers)?;
    let sink = OutputSink::new(project_dir.to_path_buf(), source.to_path_buf(), args.dry_run);

    let orchestrator = Orchestrator {
        source_root: source,
        source_files: &files,
        registry: &registry,
        cache: &cache,
        extractor,
        generator: &generator,
        sink: &sink,
        settings: &settings,
    };
    orchestrator.run(&files, args.workers)
}

/// Build, test and report. Any failure ends the phase and is recorded; the
/// generated tests and cache are unaffected.
fn verify(dotnet: &Dotnet, reportgenerator: &Path, solution: &Path, output: &Path) -> Verification {
    let mut verification = Verification::default();

    if let Err(err) = dotnet.restore_and_build(solution) {
        error!(error = %format!("{err:#}"), "solution build failed");
        verification.error = Some(format!("{err:#}"));
        return verification;
    }
    verification.built = true;
    info!("solution built successfully");

    let results_dir = output.join(COVERAGE_RESULTS_DIR);
    if let Err(err) = dotnet.test_with_coverage(solution, &results_dir) {
        error!(error = %format!("{err:#}"), "test run failed");
        verification.error = Some(format!("{err:#}"));
        return verification;
    }
    verification.tested = true;

    let Some(cobertura) = find_coverage_file(&results_dir) else {
        warn!(dir = %results_dir.display(), "could not locate coverage.cobertura.xml");
        verification.error = Some("coverage file not found".to_string());
        return verification;
    };
    verification.coverage_file = Some(cobertura.to_string_lossy().to_string());

    let report_dir = output.join(COVERAGE_REPORT_DIR);
    match generate_report(reportgenerator, &cobertura, &report_dir) {
        Ok(()) => verification.report_dir = Some(report_dir.to_string_lossy().to_string()),
        Err(err) => {
            error!(error = %format!("{err:#}"), "coverage report failed");
            verification.error = Some(format!("{err:#}"));
        }
    }
    verification
}

fn ensure_dir(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    absolute_dir(dir)
}

/// Subprocesses run with other working directories, so paths handed to them
/// must not be relative.
fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    dir.canonicalize()
        .with_context(|| format!("Directory not found: {}", dir.display()))
}
