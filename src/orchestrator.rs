//! Parallel per-file generation pipeline.
//!
//! Every source file becomes one task on a fixed-size rayon pool. A task
//! extracts the file's classes and, one class at a time in extractor order,
//! collects references, resolves the dependency closure, consults the cache,
//! generates on a miss and writes the artifact. Failures stay inside the
//! class or file they happened in.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::GenerationCache;
use crate::closure;
use crate::extractor::{ClassExtractor, ClassUnit};
use crate::generator::{PromptOptions, TestGenerator, build_prompt, generate_test_class};
use crate::parse::hash_prompt;
use crate::references::collect_references;
use crate::registry::TypeRegistry;
use crate::scan::{cache_key, relative_key};
use crate::writer::OutputSink;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub model: String,
    /// Skip cache lookups; fresh artifacts are still stored.
    pub force_regenerate: bool,
    pub prompt: PromptOptions,
}

/// Everything a task needs, shared by reference across worker threads.
pub struct Orchestrator<'a> {
    pub source_root: &'a Path,
    /// Full enumeration used by the fallback definition search.
    pub source_files: &'a [PathBuf],
    pub registry: &'a TypeRegistry,
    pub cache: &'a GenerationCache,
    pub extractor: &'a dyn ClassExtractor,
    pub generator: &'a dyn TestGenerator,
    pub sink: &'a OutputSink,
    pub settings: &'a PipelineSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    Cache,
    Generated,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassOutcome {
    pub key: String,
    pub origin: Option<ArtifactOrigin>,
    pub output: Option<String>,
    pub type_defs: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub file: String,
    /// At least one artifact was produced for this file.
    pub produced: bool,
    pub classes: Vec<ClassOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model: String,
    pub workers: usize,
    pub files: usize,
    pub files_produced: usize,
    pub artifacts: usize,
    pub cache_hits: usize,
    pub generated: usize,
    pub failed_classes: usize,
    pub failed_files: usize,
    pub duration_ms: u64,
    pub outcomes: Vec<FileOutcome>,
}

impl RunReport {
    fn new(model: &str, workers: usize, outcomes: Vec<FileOutcome>, duration_ms: u64) -> Self {
        let classes = outcomes.iter().flat_map(|o| o.classes.iter());
        let (mut cache_hits, mut generated, mut failed_classes) = (0, 0, 0);
        for class in classes {
            match class.origin {
                Some(ArtifactOrigin::Cache) => cache_hits += 1,
                Some(ArtifactOrigin::Generated) => generated += 1,
                None => failed_classes += 1,
            }
        }

        Self {
            model: model.to_string(),
            workers,
            files: outcomes.len(),
            files_produced: outcomes.iter().filter(|o| o.produced).count(),
            artifacts: cache_hits + generated,
            cache_hits,
            generated,
            failed_classes,
            failed_files: outcomes.iter().filter(|o| o.error.is_some()).count(),
            duration_ms,
            outcomes,
        }
    }
}

impl Orchestrator<'_> {
    /// Builds the type registry on a pool of `workers` threads so extractor
    /// invocations respect the same concurrency limit as generation.
    pub fn build_registry<E>(
        source_files: &[PathBuf],
        extractor: &E,
        workers: usize,
    ) -> Result<TypeRegistry>
    where
        E: ClassExtractor + ?Sized,
    {
        let pool = worker_pool(workers)?;
        Ok(pool.install(|| TypeRegistry::build(source_files, extractor)))
    }

    /// Processes `files` on `workers` threads and waits for all of them.
    pub fn run(&self, files: &[PathBuf], workers: usize) -> Result<RunReport> {
        let start = Instant::now();
        let workers = workers.max(1);
        let pool = worker_pool(workers)?;

        info!(files = files.len(), workers, model = %self.settings.model, "starting generation");
        let outcomes: Vec<FileOutcome> =
            pool.install(|| files.par_iter().map(|file| self.run_task(file)).collect());

        let report = RunReport::new(
            &self.settings.model,
            workers,
            outcomes,
            start.elapsed().as_millis() as u64,
        );
        log_summary(&report);
        Ok(report)
    }

    /// Never fails: errors and panics become a failed outcome for this file.
    fn run_task(&self, file: &Path) -> FileOutcome {
        let rel = relative_key(file, self.source_root);
        match panic::catch_unwind(AssertUnwindSafe(|| self.process_file(file, &rel))) {
            Ok(Ok(classes)) => FileOutcome {
                produced: classes.iter().any(|c| c.origin.is_some()),
                file: rel,
                classes,
                error: None,
            },
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                error!(file = %rel, error = %message, "file processing failed");
                failed_file(rel, message)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(file = %rel, panic = %message, "file task panicked");
                failed_file(rel, format!("panicked: {message}"))
            }
        }
    }

    fn process_file(&self, file: &Path, rel: &str) -> Result<Vec<ClassOutcome>> {
        let classes = self
            .extractor
            .extract(file)
            .with_context(|| format!("Extraction failed for {rel}"))?;
        if classes.is_empty() {
            debug!(file = %rel, "no classes found");
        }

        Ok(classes
            .into_iter()
            .enumerate()
            .map(|(ordinal, class)| self.process_class(file, rel, ordinal, class))
            .collect())
    }

    fn process_class(
        &self,
        file: &Path,
        rel: &str,
        ordinal: usize,
        mut class: ClassUnit,
    ) -> ClassOutcome {
        let key = cache_key(rel, &class.class_name);

        let candidates = collect_references(&class);
        let resolution = closure::resolve(&candidates, self.registry, self.source_files);
        class.apply_resolution(resolution.defs);
        let type_defs = class.referenced_type_defs.len();

        let prompt = build_prompt(&class, &self.settings.prompt);
        let content_hash = hash_prompt(&prompt);
        let model = self.settings.model.as_str();

        let cached = if self.settings.force_regenerate {
            None
        } else {
            match self.cache.lookup(&key, &content_hash, model) {
                Ok(hit) => hit,
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!(key = %key, error = %error, "cache lookup failed; regenerating");
                    None
                }
            }
        };

        let (artifact, origin) = match cached {
            Some(artifact) => {
                info!(key = %key, "cache hit");
                (artifact, ArtifactOrigin::Cache)
            }
            None => match generate_test_class(self.generator, &class.class_name, &prompt, model) {
                Ok(artifact) => {
                    if let Err(err) = self.cache.store(&key, &content_hash, model, &artifact) {
                        error!(key = %key, error = %format!("{err:#}"), "failed to write cache");
                    }
                    (artifact, ArtifactOrigin::Generated)
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "generation failed; class skipped");
                    return ClassOutcome {
                        key,
                        origin: None,
                        output: None,
                        type_defs,
                        error: Some(err.to_string()),
                    };
                }
            },
        };

        match self.sink.write(file, &class.class_name, ordinal, &artifact) {
            Ok(written) => ClassOutcome {
                key,
                origin: Some(origin),
                output: Some(written.path.to_string_lossy().to_string()),
                type_defs,
                error: None,
            },
            Err(err) => {
                let message = format!("{err:#}");
                error!(key = %key, error = %message, "failed to write test file");
                ClassOutcome {
                    key,
                    origin: None,
                    output: None,
                    type_defs,
                    error: Some(message),
                }
            }
        }
    }
}

fn worker_pool(workers: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("testgen-worker-{i}"))
        .build()
        .context("Failed to build worker pool")
}

fn failed_file(file: String, message: String) -> FileOutcome {
    FileOutcome {
        file,
        produced: false,
        classes: Vec::new(),
        error: Some(message),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_summary(report: &RunReport) {
    for outcome in &report.outcomes {
        if outcome.produced {
            info!(file = %outcome.file, "produced tests");
        } else {
            warn!(file = %outcome.file, "no tests produced");
        }
    }
    info!(
        files = report.files,
        files_produced = report.files_produced,
        artifacts = report.artifacts,
        cache_hits = report.cache_hits,
        generated = report.generated,
        failed_classes = report.failed_classes,
        failed_files = report.failed_files,
        duration_ms = report.duration_ms,
        "generation finished"
    );
}
