//! Per-session state threaded through the pipeline
//!
//! Each conversation owns a `SessionState` and hands it to
//! [`crate::engine::DecisionPipeline::evaluate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::rules::ActionOnViolation;

/// Counters shown to users and operators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Rules evaluated
    pub evaluations: u64,
    /// Rules found violated, whatever their action
    pub triggers: u64,
    pub blocks: u64,
    pub warnings: u64,
    pub logs: u64,
    /// Detection failures (counted as passes)
    pub errors: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    flags: BTreeMap<String, Value>,

    /// Normalized paths read during this session
    #[serde(default)]
    files_read: BTreeSet<String>,

    /// Successful verification runs since the last failure
    #[serde(default)]
    verification_streak: u32,

    #[serde(default)]
    pub stats: SessionStats,
}

impl SessionState {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }

    pub fn flag(&self, name: &str) -> Option<&Value> {
        self.flags.get(name)
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: Value) {
        self.flags.insert(name.into(), value);
    }

    pub fn record_read(&mut self, path: &str) {
        self.files_read.insert(normalize(path));
    }

    pub fn has_read(&self, path: &str) -> bool {
        self.files_read.contains(&normalize(path))
    }

    /// Record the outcome of a test/verification run
    pub fn record_verification(&mut self, success: bool) {
        if success {
            self.verification_streak = self.verification_streak.saturating_add(1);
        } else {
            self.verification_streak = 0;
        }
    }

    pub fn verification_streak(&self) -> u32 {
        self.verification_streak
    }

    /// Count one evaluated rule
    pub fn count_evaluation(&mut self, violated: Option<ActionOnViolation>) {
        self.stats.evaluations += 1;
        let Some(action) = violated else { return };
        self.stats.triggers += 1;
        match action {
            ActionOnViolation::Block => self.stats.blocks += 1,
            ActionOnViolation::Warn => self.stats.warnings += 1,
            ActionOnViolation::Log => self.stats.logs += 1,
        }
    }

    pub fn count_error(&mut self) {
        self.stats.evaluations += 1;
        self.stats.errors += 1;
    }

    /// File holding the state of `session_id` under `dir`
    pub fn state_path(dir: &Path, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{}.json", safe))
    }

    /// Load persisted state, starting fresh when missing or unreadable
    pub fn load(dir: &Path, session_id: &str) -> Self {
        let path = Self::state_path(dir, session_id);
        let loaded = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<SessionState>(&content).ok());

        match loaded {
            Some(state) => state,
            None => Self::new(Some(session_id.to_string())),
        }
    }

    /// Write the state file through a unique temp file and a rename, so
    /// concurrent hooks for one session never see a truncated file
    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let Some(session_id) = &self.session_id else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;

        let path = Self::state_path(dir, session_id);
        let mut tmp = path.as_os_str().to_owned();
        let seq = SAVE_SEQ.fetch_add(1, Ordering::Relaxed);
        tmp.push(format!(".{}.{}.tmp", std::process::id(), seq));
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })
    }
}

static SAVE_SEQ: AtomicU64 = AtomicU64::new(0);

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}
