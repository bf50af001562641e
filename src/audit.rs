//! JSONL audit logging for policy-guardrails
//!
//! Every rule evaluation the pipeline performs is appended as one
//! [`AuditRecord`]. Sinks are append-only; rotation is someone else's job.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::input::Phase;

/// Outcome of one rule evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Blocked,
    Warned,
    Logged,
    Passed,
    /// Detection logic failed; treated as a pass
    Error,
}

/// An audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub rule_code: String,
    pub operation_name: String,
    pub phase: Phase,
    pub outcome: Outcome,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuditRecord {
    pub fn new(
        rule_code: impl Into<String>,
        operation_name: impl Into<String>,
        phase: Phase,
        outcome: Outcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            rule_code: rule_code.into(),
            operation_name: operation_name.into(),
            phase,
            outcome,
            reason: reason.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit sink lock poisoned")]
    Poisoned,
}

/// Append-only destination for audit records
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Secret-looking values never reach the audit file
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)(api[_-]?key|secret[_-]?key|access[_-]?token)\s*[=:]\s*['\x22]?[a-zA-Z0-9_\-]{16,}").unwrap(),
        Regex::new(r"AKIA[0-9A-Z]{16}").unwrap(),
        Regex::new(r"gh[pousr]_[A-Za-z0-9_]{36,}").unwrap(),
        Regex::new(r"(?i)(password|passwd|pwd)\s*[=:]\s*['\x22][^'\x22]+['\x22]").unwrap(),
    ]
});

/// Redact secrets in text for logging
pub fn redact_secrets(text: &str) -> String {
    let mut redacted = text.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        redacted = pattern.replace_all(&redacted, "[REDACTED]").to_string();
    }
    redacted
}

/// Writes one JSON object per line to a file
pub struct JsonlAuditSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditSink {
    /// Open (or create) the log file, creating parent directories
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut record = record.clone();
        record.reason = redact_secrets(&record.reason);

        let json = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock().map_err(|_| AuditError::Poisoned)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory; used by tests and embedders that ship records elsewhere
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .map_err(|_| AuditError::Poisoned)?
            .push(record.clone());
        Ok(())
    }
}

/// Discards everything (audit logging disabled)
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn append(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}
