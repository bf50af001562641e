//! Decisions and hook output formatting
//!
//! [`Decision`] is the pipeline's verdict for one request in one phase.
//! [`HookOutput`] renders it in the JSON format Claude Code hooks expect.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::input::Phase;
use crate::locks::Access;
use crate::rules::Severity;

/// Lock registry details attached to a blocked decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockHit {
    pub module_id: String,
    pub matched_path: String,
    pub access: Access,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub touched_symbols: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

/// Verdict for one action request in one phase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub phase: Phase,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule_code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Codes of rules that fired without blocking
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockHit>,
}

impl Decision {
    /// Create an allow decision
    pub fn allow(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            blocked: false,
            matched_rule_code: None,
            message: message.into(),
            suggestion: None,
            severity: None,
            warnings: Vec::new(),
            lock: None,
        }
    }

    /// Create a block decision attributed to a rule
    pub fn block(phase: Phase, rule_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            blocked: true,
            matched_rule_code: Some(rule_code.into()),
            ..Self::allow(phase, message)
        }
    }

    /// Create a non-blocking decision that still names the rule that fired
    pub fn warn(phase: Phase, rule_code: impl Into<String>, message: impl Into<String>) -> Self {
        let rule_code = rule_code.into();
        Self {
            warnings: vec![rule_code.clone()],
            matched_rule_code: Some(rule_code),
            ..Self::allow(phase, message)
        }
    }

    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Check if this is an allow decision
    pub fn is_allow(&self) -> bool {
        !self.blocked
    }

    /// Check if this is a block decision
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Get the rule code if applicable
    pub fn rule_code(&self) -> Option<&str> {
        self.matched_rule_code.as_deref()
    }

    /// Downgrade a block into a warning, keeping the attribution
    pub fn into_warning(mut self) -> Self {
        if self.blocked {
            self.blocked = false;
            if let Some(code) = &self.matched_rule_code {
                if !self.warnings.contains(code) {
                    self.warnings.push(code.clone());
                }
            }
        }
        self
    }
}

/// Main output structure for Claude Code hooks
#[derive(Debug, Serialize)]
pub struct HookOutput {
    /// Hook-specific output containing the permission decision
    #[serde(rename = "hookSpecificOutput", skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,

    /// Optional system message to show the user
    #[serde(rename = "systemMessage", skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

/// Hook-specific output with permission decision
#[derive(Debug, Serialize)]
pub struct HookSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: String,

    /// Permission decision: "allow" or "deny"
    #[serde(rename = "permissionDecision")]
    pub permission_decision: String,

    #[serde(rename = "permissionDecisionReason", skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
}

impl HookOutput {
    /// Create an allow response (empty output = allow)
    pub fn allow() -> Self {
        HookOutput {
            hook_specific_output: None,
            system_message: None,
        }
    }

    /// Create a deny response with rule code and reason
    pub fn deny_with_rule(rule_code: &str, reason: &str) -> Self {
        HookOutput {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: "PreToolUse".to_string(),
                permission_decision: "deny".to_string(),
                permission_decision_reason: Some(reason.to_string()),
            }),
            system_message: Some(format!("[guardrails:{}] Blocked: {}", rule_code, reason)),
        }
    }

    /// Create a warn response (allows but shows warning)
    pub fn warn(message: &str) -> Self {
        HookOutput {
            hook_specific_output: None,
            system_message: Some(format!("[guardrails] Warning: {}", message)),
        }
    }

    /// Create output from a Decision
    pub fn from_decision(decision: &Decision) -> Self {
        if decision.blocked {
            let rule_code = decision.rule_code().unwrap_or("policy");
            let reason = match &decision.suggestion {
                Some(hint) => format!("{} (hint: {})", decision.message, hint),
                None => decision.message.clone(),
            };
            return HookOutput::deny_with_rule(rule_code, &reason);
        }

        if !decision.warnings.is_empty() {
            return HookOutput::warn(&format!(
                "{} [{}]",
                decision.message,
                decision.warnings.join(", ")
            ));
        }

        HookOutput::allow()
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
