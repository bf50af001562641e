//! Module lock registry
//!
//! A JSON document maps module ids to lock state. While a module is locked,
//! writes and deletes of its protected paths are vetoed, and patches that
//! touch its protected symbols are vetoed even through a sibling file with
//! the same stem. Reads are always allowed.
//!
//! The table is immutable once built; readers clone an `Arc` to it and
//! every change (reload or administrative) builds a new table and swaps it
//! in whole.

pub mod matching;
pub mod watcher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::parser;
use matching::PathMatcher;
pub use watcher::ConfigWatcher;

/// Argument keys that carry a file path, in lookup order
pub const PATH_ARGUMENT_KEYS: &[&str] = &["file_path", "path", "notebook_path", "target_file", "filename"];

/// What an operation does to its target file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    Delete,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Delete => "delete",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "modified",
            Access::Delete => "deleted",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First non-empty path argument
pub fn path_argument(arguments: &Map<String, Value>) -> Option<&str> {
    PATH_ARGUMENT_KEYS
        .iter()
        .filter_map(|key| arguments.get(*key).and_then(Value::as_str))
        .find(|path| !path.trim().is_empty())
}

/// Whether the arguments describe an in-place patch rather than a whole-file write
pub fn is_patch_operation(arguments: &Map<String, Value>) -> bool {
    arguments.contains_key("old_string")
        || arguments.contains_key("new_string")
        || arguments.get("edits").is_some_and(Value::is_array)
}

/// Text fragments of a patch: old and new strings, including multi-edit entries
fn patch_texts(arguments: &Map<String, Value>) -> Vec<&str> {
    let mut texts = Vec::new();
    for key in ["old_string", "new_string"] {
        if let Some(text) = arguments.get(key).and_then(Value::as_str) {
            texts.push(text);
        }
    }
    if let Some(Value::Array(edits)) = arguments.get("edits") {
        for edit in edits {
            for key in ["old_string", "new_string"] {
                if let Some(text) = edit.get(key).and_then(Value::as_str) {
                    texts.push(text);
                }
            }
        }
    }
    texts
}

/// Static operation name table
const READ_OPERATIONS: &[&str] = &["Read", "read_file", "view", "View", "Glob", "Grep", "LS", "list_dir", "open_file"];
const WRITE_OPERATIONS: &[&str] = &[
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "write_file",
    "edit_file",
    "create_file",
    "apply_patch",
    "str_replace",
    "replace_in_file",
];
const DELETE_OPERATIONS: &[&str] = &["delete_file", "remove_file", "Delete", "rm"];
const SHELL_OPERATIONS: &[&str] = &["Bash", "bash", "shell", "run_command", "execute_command", "run_terminal_cmd", "terminal"];

/// Classify a file operation by name, falling back to its arguments
pub fn classify_operation(operation_name: &str, arguments: &Map<String, Value>) -> Access {
    if READ_OPERATIONS.contains(&operation_name) {
        return Access::Read;
    }
    if WRITE_OPERATIONS.contains(&operation_name) {
        return Access::Write;
    }
    if DELETE_OPERATIONS.contains(&operation_name) {
        return Access::Delete;
    }

    let lower = operation_name.to_lowercase();
    if ["delete", "remove", "unlink"].iter().any(|k| lower.contains(k)) {
        return Access::Delete;
    }
    if ["write", "edit", "create", "replace", "patch", "move", "rename", "save"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return Access::Write;
    }
    if is_patch_operation(arguments) || arguments.contains_key("content") {
        return Access::Write;
    }
    Access::Read
}

fn is_shell_operation(operation_name: &str, arguments: &Map<String, Value>) -> bool {
    SHELL_OPERATIONS.contains(&operation_name)
        || (path_argument(arguments).is_none() && arguments.get("command").is_some_and(Value::is_string))
}

/// One module entry of the lock document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockModule {
    /// Key of the entry in the document
    #[serde(skip)]
    pub module_id: String,

    #[serde(rename = "name", default)]
    pub display_name: String,

    #[serde(default)]
    pub locked: bool,

    #[serde(default)]
    pub protected_paths: Vec<String>,

    #[serde(default)]
    pub protected_symbols: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_command: Option<String>,

    /// Replaces the generated block message when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl LockModule {
    pub fn new(module_id: impl Into<String>, protected_paths: Vec<String>) -> Self {
        let module_id = module_id.into();
        Self {
            display_name: module_id.clone(),
            module_id,
            locked: false,
            protected_paths,
            protected_symbols: Vec::new(),
            locked_at: None,
            locked_reason: None,
            unlocked_at: None,
            unlocked_reason: None,
            lock_command: None,
            unlock_command: None,
            feedback: None,
        }
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.protected_symbols = symbols;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn locked(mut self, reason: impl Into<String>) -> Self {
        self.locked = true;
        self.locked_reason = Some(reason.into());
        self.locked_at = Some(Utc::now());
        self
    }

    fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.module_id
        } else {
            &self.display_name
        }
    }

    fn block_message(&self, path: &str, access: Access, touched: &[String]) -> String {
        if let Some(feedback) = &self.feedback {
            return feedback.clone();
        }

        let mut message = if touched.is_empty() {
            format!("Module '{}' is locked: {} cannot be {}", self.label(), path, access.verb())
        } else {
            format!(
                "Module '{}' is locked: {} touches protected symbols {}",
                self.label(),
                path,
                touched.join(", ")
            )
        };
        if let Some(reason) = &self.locked_reason {
            message.push_str(&format!(". Reason: {}", reason));
        }
        if let Some(at) = &self.locked_at {
            message.push_str(&format!(". Locked at {}", at.to_rfc3339()));
        }
        message
    }

    fn unlock_hint(&self) -> String {
        match &self.unlock_command {
            Some(command) => format!("Unlock first with: {}", command),
            None => format!("Unlock module '{}' before changing these files", self.module_id),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledModule {
    module: LockModule,
    paths: PathMatcher,
}

impl CompiledModule {
    fn new(module: LockModule) -> Self {
        let paths = PathMatcher::new(&module.protected_paths);
        Self { module, paths }
    }
}

/// Immutable snapshot of every module
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    modules: BTreeMap<String, CompiledModule>,
}

impl LockTable {
    pub fn new(modules: Vec<LockModule>) -> Self {
        let modules = modules
            .into_iter()
            .map(|m| (m.module_id.clone(), CompiledModule::new(m)))
            .collect();
        Self { modules }
    }

    /// Parse the JSON lock document
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let document: BTreeMap<String, LockModule> = serde_json::from_str(content)?;
        let modules = document
            .into_iter()
            .map(|(id, mut module)| {
                module.module_id = id;
                module
            })
            .collect();
        Ok(Self::new(modules))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let document: BTreeMap<&str, &LockModule> = self
            .modules
            .iter()
            .map(|(id, compiled)| (id.as_str(), &compiled.module))
            .collect();
        serde_json::to_string_pretty(&document)
    }

    pub fn get(&self, module_id: &str) -> Option<&LockModule> {
        self.modules.get(module_id).map(|c| &c.module)
    }

    pub fn modules(&self) -> impl Iterator<Item = &LockModule> {
        self.modules.values().map(|c| &c.module)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn locked(&self) -> impl Iterator<Item = &CompiledModule> {
        self.modules.values().filter(|c| c.module.locked)
    }

    fn upsert(&mut self, module: LockModule) {
        self.modules.insert(module.module_id.clone(), CompiledModule::new(module));
    }

    /// Decide whether `path` may be accessed
    pub fn check_path(&self, path: &str, access: Access, patch_texts: &[&str]) -> LockDecision {
        if access == Access::Read {
            return LockDecision::allow(Some(path), Some(access));
        }

        for compiled in self.locked() {
            if compiled.paths.matches(path) {
                let touched = matching::touched_symbols(&compiled.module.protected_symbols, patch_texts);
                return LockDecision::block(&compiled.module, path, access, touched);
            }
        }

        if patch_texts.is_empty() {
            return LockDecision::allow(Some(path), Some(access));
        }

        for compiled in self.locked() {
            if compiled.module.protected_symbols.is_empty() || !compiled.paths.shares_stem(path) {
                continue;
            }
            let touched = matching::touched_symbols(&compiled.module.protected_symbols, patch_texts);
            if !touched.is_empty() {
                return LockDecision::block(&compiled.module, path, access, touched);
            }
        }

        LockDecision::allow(Some(path), Some(access))
    }

    /// Differences between this table and `next`
    pub fn diff(&self, next: &LockTable) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        for (id, compiled) in &next.modules {
            match self.modules.get(id) {
                None => {
                    summary.added.push(id.clone());
                    if compiled.module.locked {
                        summary.newly_locked.push(id.clone());
                    }
                }
                Some(previous) if !previous.module.locked && compiled.module.locked => {
                    summary.newly_locked.push(id.clone());
                }
                Some(previous) if previous.module.locked && !compiled.module.locked => {
                    summary.newly_unlocked.push(id.clone());
                }
                Some(_) => {}
            }
        }
        for id in self.modules.keys() {
            if !next.modules.contains_key(id) {
                summary.removed.push(id.clone());
            }
        }

        summary
    }
}

/// Outcome of a lock check
#[derive(Debug, Clone, PartialEq)]
pub struct LockDecision {
    pub blocked: bool,
    pub module_id: Option<String>,
    pub matched_path: Option<String>,
    pub access: Option<Access>,
    pub touched_symbols: Vec<String>,
    pub message: String,
    pub suggestion: Option<String>,
    pub locked_reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl LockDecision {
    fn allow(path: Option<&str>, access: Option<Access>) -> Self {
        Self {
            blocked: false,
            module_id: None,
            matched_path: path.map(str::to_string),
            access,
            touched_symbols: Vec::new(),
            message: String::new(),
            suggestion: None,
            locked_reason: None,
            locked_at: None,
        }
    }

    fn block(module: &LockModule, path: &str, access: Access, touched: Vec<String>) -> Self {
        Self {
            blocked: true,
            module_id: Some(module.module_id.clone()),
            matched_path: Some(path.to_string()),
            access: Some(access),
            message: module.block_message(path, access, &touched),
            touched_symbols: touched,
            suggestion: Some(module.unlock_hint()),
            locked_reason: module.locked_reason.clone(),
            locked_at: module.locked_at,
        }
    }
}

/// Modules whose state changed in a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub newly_locked: Vec<String>,
    pub newly_unlocked: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.newly_locked.is_empty()
            && self.newly_unlocked.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
    }
}

impl fmt::Display for ReloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} locked, {} unlocked, {} added, {} removed",
            self.newly_locked.len(),
            self.newly_unlocked.len(),
            self.added.len(),
            self.removed.len()
        )
    }
}

/// Result of an administrative change
#[derive(Debug, Clone, PartialEq)]
pub struct LockChange {
    pub changed: bool,
    pub module: LockModule,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock config {path} is malformed: {source}")]
    ConfigMalformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read lock config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist lock config {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown lock module: {0}")]
    ModuleNotFound(String),

    #[error("failed to watch lock config: {0}")]
    Watch(#[from] notify::Error),
}

/// Shared lock state with hot reload and administration
pub struct LockRegistry {
    /// Backing document; `None` keeps the registry in memory only
    path: Option<PathBuf>,
    table: RwLock<Arc<LockTable>>,
    /// Serializes reloads and administrative writes
    write_guard: Mutex<()>,
    wrappers: Vec<String>,
}

impl LockRegistry {
    /// Load the registry from `path`; a missing file yields an empty table
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let table = if path.exists() {
            read_table(&path)?
        } else {
            debug!(path = %path.display(), "no lock config, starting empty");
            LockTable::default()
        };

        Ok(Self::from_table(Some(path), table))
    }

    pub fn in_memory(modules: Vec<LockModule>) -> Self {
        Self::from_table(None, LockTable::new(modules))
    }

    fn from_table(path: Option<PathBuf>, table: LockTable) -> Self {
        Self {
            path,
            table: RwLock::new(Arc::new(table)),
            write_guard: Mutex::new(()),
            wrappers: parser::wrapper::DEFAULT_WRAPPERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Wrapper commands stripped before shell target extraction
    pub fn with_wrappers(mut self, wrappers: Vec<String>) -> Self {
        self.wrappers = wrappers;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Arc<LockTable> {
        match self.table.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, next: LockTable) {
        let next = Arc::new(next);
        match self.table.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn module(&self, module_id: &str) -> Option<LockModule> {
        self.snapshot().get(module_id).cloned()
    }

    pub fn modules(&self) -> Vec<LockModule> {
        self.snapshot().modules().cloned().collect()
    }

    /// Decide whether an operation may touch its target files
    ///
    /// Shell commands can name several files; each is checked and the first
    /// locked hit blocks.
    pub fn check_operation(&self, operation_name: &str, arguments: &Map<String, Value>) -> LockDecision {
        let targets: Vec<(String, Access)> = if let Some(path) = path_argument(arguments) {
            vec![(path.to_string(), classify_operation(operation_name, arguments))]
        } else if is_shell_operation(operation_name, arguments) {
            arguments
                .get("command")
                .or_else(|| arguments.get("cmd"))
                .and_then(Value::as_str)
                .map(|command| parser::extract_targets(command, &self.wrappers))
                .unwrap_or_default()
                .into_iter()
                .map(|t| (t.path, t.access))
                .collect()
        } else {
            Vec::new()
        };

        let texts = if is_patch_operation(arguments) {
            patch_texts(arguments)
        } else {
            Vec::new()
        };

        let table = self.snapshot();
        let mut first_allowed = None;
        for (path, access) in &targets {
            let decision = table.check_path(path, *access, &texts);
            if decision.blocked {
                debug!(operation = operation_name, path = %path, module = ?decision.module_id, "lock veto");
                return decision;
            }
            first_allowed.get_or_insert(decision);
        }

        first_allowed.unwrap_or_else(|| LockDecision::allow(None, None))
    }

    /// Re-read the backing document and swap it in
    ///
    /// On failure the previous table stays in place.
    pub fn reload(&self) -> Result<ReloadSummary, LockError> {
        let Some(path) = &self.path else {
            return Ok(ReloadSummary::default());
        };
        let _guard = self.write_guard.lock().unwrap_or_else(|p| p.into_inner());

        let next = match read_table(path) {
            Ok(table) => table,
            Err(e) => {
                error!(path = %path.display(), error = %e, "lock config reload failed, keeping previous state");
                return Err(e);
            }
        };

        let summary = self.snapshot().diff(&next);
        self.swap(next);
        info!(path = %path.display(), %summary, "lock config reloaded");
        Ok(summary)
    }

    pub fn lock(&self, module_id: &str, reason: &str) -> Result<LockChange, LockError> {
        self.update(module_id, |module| {
            if module.locked {
                return false;
            }
            module.locked = true;
            module.locked_at = Some(Utc::now());
            module.locked_reason = Some(reason.to_string());
            true
        })
    }

    pub fn unlock(&self, module_id: &str, reason: &str) -> Result<LockChange, LockError> {
        self.update(module_id, |module| {
            if !module.locked {
                return false;
            }
            module.locked = false;
            module.unlocked_at = Some(Utc::now());
            module.unlocked_reason = Some(reason.to_string());
            true
        })
    }

    /// Insert or replace a module definition
    pub fn register_module(&self, module: LockModule) -> Result<LockChange, LockError> {
        let _guard = self.write_guard.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.snapshot();

        if current.get(&module.module_id) == Some(&module) {
            return Ok(LockChange { changed: false, module });
        }

        let mut next = (*current).clone();
        next.upsert(module.clone());
        self.commit(next)?;
        info!(module = %module.module_id, "lock module registered");
        Ok(LockChange { changed: true, module })
    }

    fn update<F>(&self, module_id: &str, mutate: F) -> Result<LockChange, LockError>
    where
        F: FnOnce(&mut LockModule) -> bool,
    {
        let _guard = self.write_guard.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.snapshot();
        let mut module = current
            .get(module_id)
            .cloned()
            .ok_or_else(|| LockError::ModuleNotFound(module_id.to_string()))?;

        if !mutate(&mut module) {
            return Ok(LockChange { changed: false, module });
        }

        let mut next = (*current).clone();
        next.upsert(module.clone());
        self.commit(next)?;
        info!(module = module_id, locked = module.locked, "lock state changed");
        Ok(LockChange { changed: true, module })
    }

    /// Persist `next` then make it current; memory is untouched on failure
    fn commit(&self, next: LockTable) -> Result<(), LockError> {
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        self.swap(next);
        Ok(())
    }

    /// Reload whenever the backing document changes on disk
    ///
    /// `on_reload` runs on the watcher thread after every attempt.
    pub fn watch<F>(self: &Arc<Self>, debounce: Duration, on_reload: F) -> Result<Option<ConfigWatcher>, LockError>
    where
        F: Fn(&Result<ReloadSummary, LockError>) + Send + 'static,
    {
        let Some(path) = self.path.clone() else {
            return Ok(None);
        };
        let registry: Weak<Self> = Arc::downgrade(self);
        let watcher = ConfigWatcher::spawn(&path, debounce, move || {
            if let Some(registry) = registry.upgrade() {
                let result = registry.reload();
                on_reload(&result);
            }
        })?;
        Ok(Some(watcher))
    }
}

fn read_table(path: &Path) -> Result<LockTable, LockError> {
    let content = std::fs::read_to_string(path).map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    LockTable::from_json(&content).map_err(|source| LockError::ConfigMalformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a sibling temp file, then rename over the document
fn persist(path: &Path, table: &LockTable) -> Result<(), LockError> {
    let persist_err = |source: std::io::Error| LockError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let json = table.to_json().map_err(|e| persist_err(std::io::Error::other(e)))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(persist_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).map_err(persist_err)?;
    std::fs::rename(&tmp, path).map_err(persist_err)
}
