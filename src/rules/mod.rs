//! Rule definitions for policy-guardrails
//!
//! Rules are persisted outside the process and loaded through a
//! [`store::RuleSource`]. Everything here is plain data; evaluation lives in
//! [`crate::engine`].

pub mod builtin;
pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::input::Phase;

/// Phases a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseScope {
    Pre,
    Mid,
    Post,
    Response,
    All,
}

impl PhaseScope {
    /// Whether a rule with this scope participates in `phase`
    pub fn covers(&self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (PhaseScope::All, _)
                | (PhaseScope::Pre, Phase::Pre)
                | (PhaseScope::Mid, Phase::Mid)
                | (PhaseScope::Post, Phase::Post)
                | (PhaseScope::Response, Phase::Response)
        )
    }
}

/// How a generic rule detects a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Flag,
    Name,
    Args,
    Regex,
    ApiCall,
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectionType::Flag => "flag",
            DetectionType::Name => "name",
            DetectionType::Args => "args",
            DetectionType::Regex => "regex",
            DetectionType::ApiCall => "api_call",
        };
        f.write_str(s)
    }
}

/// What happens when a rule is violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOnViolation {
    #[default]
    Block,
    Warn,
    Log,
}

/// Rule severity, ordered LOW < MEDIUM < HIGH < CRITICAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parse a severity name, case-insensitive. Unknown names are LOW.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "MEDIUM" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Severity::parse(&raw))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Strategy used when several rules of one conflict group fire together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    Override,
    Merge,
    #[default]
    HighestPriority,
    FirstMatch,
    Custom,
}

fn default_true() -> bool {
    true
}

fn default_group() -> String {
    "default".to_string()
}

fn default_conflict_priority() -> i64 {
    5
}

/// A persisted policy rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique, immutable identifier
    pub rule_code: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    pub phase_scope: PhaseScope,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i64,

    pub detection_type: DetectionType,

    /// Type-specific payload interpreted by the detector
    #[serde(default)]
    pub detection_pattern: serde_json::Value,

    #[serde(default)]
    pub action_on_violation: ActionOnViolation,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default = "default_group")]
    pub conflict_group: String,

    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    #[serde(default = "default_conflict_priority")]
    pub conflict_priority: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    /// Name of a registered resolver for the `custom` conflict strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_resolver: Option<String>,
}

impl Rule {
    /// Create an enabled rule with default conflict settings
    pub fn new(
        rule_code: impl Into<String>,
        phase_scope: PhaseScope,
        detection_type: DetectionType,
        detection_pattern: serde_json::Value,
    ) -> Self {
        let rule_code = rule_code.into();
        Self {
            name: rule_code.clone(),
            rule_code,
            phase_scope,
            enabled: true,
            priority: 0,
            detection_type,
            detection_pattern,
            action_on_violation: ActionOnViolation::Block,
            severity: Severity::Low,
            conflict_group: default_group(),
            conflict_strategy: ConflictStrategy::HighestPriority,
            conflict_priority: default_conflict_priority(),
            message: None,
            suggestion: None,
            custom_resolver: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action(mut self, action: ActionOnViolation) -> Self {
        self.action_on_violation = action;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_conflict(
        mut self,
        group: impl Into<String>,
        strategy: ConflictStrategy,
        conflict_priority: i64,
    ) -> Self {
        self.conflict_group = group.into();
        self.conflict_strategy = strategy;
        self.conflict_priority = conflict_priority;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_custom_resolver(mut self, name: impl Into<String>) -> Self {
        self.custom_resolver = Some(name.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Message shown to the caller when this rule fires
    pub fn display_message(&self) -> String {
        match &self.message {
            Some(message) if !message.is_empty() => message.clone(),
            _ if !self.name.is_empty() => format!("Rule {} violated: {}", self.rule_code, self.name),
            _ => format!("Rule {} violated", self.rule_code),
        }
    }
}

/// How a rule is evaluated: through the generic detector or a bespoke handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Generic(DetectionType),
    BuiltIn(builtin::BuiltinId),
}
