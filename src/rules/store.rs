//! Rule sources and the per-phase rule cache
//!
//! A [`RuleSource`] answers one query: the enabled rules for a phase,
//! highest priority first. [`RuleCache`] sits in front of it with a short TTL.

use dashmap::DashMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::Rule;
use crate::input::Phase;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rule store unavailable: {0}")]
    Unavailable(String),

    #[error("rule store returned malformed data: {0}")]
    Malformed(String),
}

/// Read-only query interface over persisted rules
pub trait RuleSource: Send + Sync {
    /// Enabled rules whose scope is `phase` or `all`, ordered by priority descending
    fn query_rules(&self, phase: Phase) -> Result<Vec<Rule>, StoreError>;
}

/// Apply the store query to an in-memory row set
pub fn select_rules(rows: &[Rule], phase: Phase) -> Vec<Rule> {
    let mut selected: Vec<Rule> = rows
        .iter()
        .filter(|r| r.enabled && r.phase_scope.covers(phase))
        .cloned()
        .collect();
    // Stable: equal priorities keep storage order
    selected.sort_by(|a, b| b.priority.cmp(&a.priority));
    selected
}

/// Rules held in process memory
#[derive(Default)]
pub struct MemoryRuleSource {
    rows: RwLock<Vec<Rule>>,
    queries: AtomicUsize,
}

impl MemoryRuleSource {
    pub fn new(rows: Vec<Rule>) -> Self {
        Self {
            rows: RwLock::new(rows),
            queries: AtomicUsize::new(0),
        }
    }

    /// Replace all rows (an external admin edit)
    pub fn replace(&self, rows: Vec<Rule>) {
        if let Ok(mut guard) = self.rows.write() {
            *guard = rows;
        }
    }

    /// Number of queries served so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

impl RuleSource for MemoryRuleSource {
    fn query_rules(&self, phase: Phase) -> Result<Vec<Rule>, StoreError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let rows = self
            .rows
            .read()
            .map_err(|_| StoreError::Unavailable("rule rows lock poisoned".to_string()))?;
        Ok(select_rules(&rows, phase))
    }
}

/// The rules file structure
#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rule: Vec<Rule>,
}

/// Rules stored as `[[rule]]` tables in a TOML file, re-read on every query
pub struct TomlRuleSource {
    path: PathBuf,
}

impl TomlRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every row in the file, enabled or not
    pub fn load_all(&self) -> Result<Vec<Rule>, StoreError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        let file: RulesFile = toml::from_str(&content)
            .map_err(|e| StoreError::Malformed(format!("{}: {}", self.path.display(), e)))?;
        Ok(file.rule)
    }
}

impl RuleSource for TomlRuleSource {
    fn query_rules(&self, phase: Phase) -> Result<Vec<Rule>, StoreError> {
        Ok(select_rules(&self.load_all()?, phase))
    }
}

struct CacheEntry {
    rules: Arc<Vec<Rule>>,
    loaded_at: Instant,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub store_errors: u64,
}

/// Short-TTL cache of rule sets keyed by phase
///
/// Buckets are replaced whole, never mutated, so a reader holding an `Arc`
/// from a previous load keeps a consistent slice. Concurrent misses for one
/// phase may each query the source; the last writer wins.
pub struct RuleCache {
    source: Arc<dyn RuleSource>,
    ttl: Duration,
    buckets: DashMap<Phase, CacheEntry>,
    /// Survives invalidation; served when the source is down
    last_good: DashMap<Phase, Arc<Vec<Rule>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    store_errors: AtomicU64,
}

impl RuleCache {
    pub fn new(source: Arc<dyn RuleSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            buckets: DashMap::new(),
            last_good: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    /// Rules for a phase, from cache when fresh
    pub fn load_rules(&self, phase: Phase) -> Arc<Vec<Rule>> {
        if let Some(entry) = self.buckets.get(&phase) {
            if entry.loaded_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(phase = %phase, "rule cache hit");
                return Arc::clone(&entry.rules);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(phase = %phase, "rule cache miss");

        match self.source.query_rules(phase) {
            Ok(rules) => {
                let rules = Arc::new(rules);
                self.buckets.insert(
                    phase,
                    CacheEntry {
                        rules: Arc::clone(&rules),
                        loaded_at: Instant::now(),
                    },
                );
                self.last_good.insert(phase, Arc::clone(&rules));
                rules
            }
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                match self.last_good.get(&phase) {
                    Some(previous) => {
                        warn!(phase = %phase, error = %e, "rule store failed, serving last good rules");
                        Arc::clone(&previous)
                    }
                    None => {
                        warn!(phase = %phase, error = %e, "rule store failed, no cached rules");
                        Arc::new(Vec::new())
                    }
                }
            }
        }
    }

    /// Drop every cached bucket
    pub fn invalidate_all(&self) {
        self.buckets.clear();
        debug!("rule cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
