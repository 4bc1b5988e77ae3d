//! Persistent cache of generated test classes.
//!
//! Uses LMDB (via heed). One row per logical key (`relative/path.cs::Class`),
//! holding the artifact together with the content hash and model that
//! produced it. Every lookup and store runs in its own transaction, so
//! readers only ever see committed rows and concurrent writers are
//! serialized by LMDB with the last commit winning.
//!
//! There is no lock spanning lookup, generation and store: two workers that
//! miss on the same key will both generate, and the later store wins.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const GENERATED_TESTS_DB: &str = "generated_tests";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 8;

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_hash: String,
    pub model_id: String,
    pub artifact: String,
    /// Unix seconds.
    pub written_at: u64,
}

impl CacheEntry {
    fn matches(&self, content_hash: &str, model_id: &str) -> bool {
        self.content_hash == content_hash && self.model_id == model_id
    }
}

#[derive(Debug)]
pub struct GenerationCache {
    env: Env,
    db_path: PathBuf,
    entries: StrDb,
}

impl GenerationCache {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        Self::open_with_map_size(db_path, DEFAULT_MAP_SIZE)
    }

    fn open_with_map_size(db_path: PathBuf, map_size: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory: {}", parent.display())
            })?;
        }

        let env = open_env(&db_path, map_size)?;
        let mut wtxn = env.write_txn()?;
        let entries = env.create_database::<Str, Str>(&mut wtxn, Some(GENERATED_TESTS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            entries,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// The cached artifact for `key`, only if it was produced from the same
    /// content hash by the same model.
    pub fn lookup(&self, key: &str, content_hash: &str, model_id: &str) -> Result<Option<String>> {
        let Some(entry) = self.entry(key)? else {
            debug!(key, "cache miss");
            return Ok(None);
        };

        if entry.matches(content_hash, model_id) {
            debug!(key, "cache hit");
            Ok(Some(entry.artifact))
        } else {
            debug!(key, "cache stale");
            Ok(None)
        }
    }

    /// Inserts or replaces the row for `key`.
    pub fn store(
        &self,
        key: &str,
        content_hash: &str,
        model_id: &str,
        artifact: &str,
    ) -> Result<()> {
        let entry = CacheEntry {
            content_hash: content_hash.to_string(),
            model_id: model_id.to_string(),
            artifact: artifact.to_string(),
            written_at: unix_now(),
        };
        let value = serde_json::to_string(&entry)?;

        let mut wtxn = self.env.write_txn()?;
        self.entries.put(&mut wtxn, key, value.as_str())?;
        wtxn.commit()
            .with_context(|| format!("Failed to commit cache entry for {key}"))?;
        debug!(key, "cached generated test");
        Ok(())
    }

    pub fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.entries.get(&rtxn, key)? else {
            return Ok(None);
        };
        let entry = serde_json::from_str(raw)
            .with_context(|| format!("Corrupt cache entry for {key}"))?;
        Ok(Some(entry))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let rtxn = self.env.read_txn()?;

        let mut entries = 0u64;
        let mut unreadable = 0u64;
        let mut by_model: BTreeMap<String, u64> = BTreeMap::new();
        let mut last_write = None;
        for item in self.entries.iter(&rtxn)? {
            let (_, raw) = item?;
            entries += 1;
            let Ok(entry) = serde_json::from_str::<CacheEntry>(raw) else {
                unreadable += 1;
                continue;
            };
            *by_model.entry(entry.model_id).or_default() += 1;
            last_write = last_write.max(Some(entry.written_at));
        }

        Ok(CacheStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            entries,
            unreadable,
            by_model,
            last_write,
        })
    }
}

fn open_env(db_path: &Path, map_size: usize) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(map_size);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: default LMDB locking stays enabled; NO_SUB_DIR keeps the cache a
    // single file at the --db path.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(db_path)
            .with_context(|| format!("Failed to create/open cache env: {}", db_path.display()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
impl GenerationCache {
    /// A cache whose map holds little more than its own bookkeeping, so
    /// storing a large artifact fails with `MDB_MAP_FULL`.
    pub(crate) fn open_cramped(db_path: PathBuf) -> Result<Self> {
        Self::open_with_map_size(db_path, 1024 * 1024)
    }

    /// Writes `raw` as the row for `key`, bypassing `CacheEntry` encoding.
    pub(crate) fn put_raw(&self, key: &str, raw: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.entries.put(&mut wtxn, key, raw)?;
        wtxn.commit()?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub db_path: String,
    pub entries: u64,
    pub unreadable: u64,
    pub by_model: BTreeMap<String, u64>,
    pub last_write: Option<u64>,
}
