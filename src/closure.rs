//! Dependency closure resolution: picks the type definitions that accompany
//! a class into its prompt.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, trace};

use crate::registry::TypeRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Selected definitions, keyed by candidate name.
    pub defs: BTreeMap<String, String>,
    pub from_registry: usize,
    pub from_fallback: usize,
    /// Source files read by the fallback search.
    pub fallback_scans: usize,
}

/// Resolves `candidates` against the registry, then searches the source
/// files for whatever is still missing.
///
/// A name missing from both is dropped. Every key of the result is a member
/// of `candidates`.
pub fn resolve(
    candidates: &BTreeSet<String>,
    registry: &TypeRegistry,
    source_files: &[PathBuf],
) -> Resolution {
    let mut resolution = Resolution::default();

    for name in candidates {
        if let Some(source) = registry.get(name) {
            resolution.defs.insert(name.clone(), source.to_string());
            resolution.from_registry += 1;
        }
    }

    let missing: Vec<&String> = candidates
        .iter()
        .filter(|name| !resolution.defs.contains_key(*name))
        .collect();
    if missing.is_empty() || source_files.is_empty() {
        return resolution;
    }

    let mut scanner = FallbackScanner::new(source_files);
    for name in missing {
        if let Some(source) = scanner.find_definition(name) {
            resolution.defs.insert(name.clone(), source);
            resolution.from_fallback += 1;
        } else {
            trace!(name = %name, "no definition found");
        }
    }
    resolution.fallback_scans = scanner.reads;

    debug!(
        candidates = candidates.len(),
        from_registry = resolution.from_registry,
        from_fallback = resolution.from_fallback,
        fallback_scans = resolution.fallback_scans,
        "closure resolved"
    );
    resolution
}

/// `class <name>` or `interface <name>` as whole words.
pub fn definition_pattern(name: &str) -> Option<Regex> {
    if name.trim().is_empty() {
        return None;
    }
    Regex::new(&format!(r"\b(?:class|interface)\s+{}\b", regex::escape(name))).ok()
}

/// Linear first-match search over the source files. Each file is read at
/// most once per resolution; unreadable files are skipped.
struct FallbackScanner<'a> {
    files: &'a [PathBuf],
    contents: Vec<Option<Option<String>>>,
    reads: usize,
}

impl<'a> FallbackScanner<'a> {
    fn new(files: &'a [PathBuf]) -> Self {
        Self {
            files,
            contents: vec![None; files.len()],
            reads: 0,
        }
    }

    fn find_definition(&mut self, name: &str) -> Option<String> {
        let pattern = definition_pattern(name)?;
        for idx in 0..self.files.len() {
            let Some(content) = self.content(idx) else {
                continue;
            };
            if pattern.is_match(content) {
                return Some(content.to_string());
            }
        }
        None
    }

    fn content(&mut self, idx: usize) -> Option<&str> {
        if self.contents[idx].is_none() {
            self.reads += 1;
            let loaded = std::fs::read(&self.files[idx])
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            self.contents[idx] = Some(loaded);
        }
        self.contents[idx].as_ref().and_then(|c| c.as_deref())
    }
}
