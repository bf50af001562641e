//! Input types for policy-guardrails
//!
//! [`ActionRequest`] is what the pipeline evaluates. [`HookInput`] parses the
//! JSON that Claude Code sends to hooks on stdin and converts it into a
//! request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Point in an operation's lifecycle at which rules are evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Mid,
    Post,
    Response,
}

impl Phase {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pre" => Some(Phase::Pre),
            "mid" => Some(Phase::Mid),
            "post" => Some(Phase::Post),
            "response" => Some(Phase::Response),
            _ => None,
        }
    }

    /// Map a Claude Code hook event name onto a phase
    pub fn from_hook_event(event: &str) -> Option<Self> {
        match event {
            "PreToolUse" | "UserPromptSubmit" => Some(Phase::Pre),
            "PostToolUse" => Some(Phase::Post),
            "Stop" | "SubagentStop" => Some(Phase::Response),
            _ => None,
        }
    }

    /// Whether a violation in this phase can still stop the operation
    pub fn can_block(&self) -> bool {
        matches!(self, Phase::Pre | Phase::Mid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Mid => "mid",
            Phase::Post => "post",
            Phase::Response => "response",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted operation submitted to the pipeline
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub operation_name: String,
    pub arguments: Map<String, Value>,
    pub phase: Phase,
    /// Result of the operation, for mid/post/response phases
    pub result_snapshot: Option<Value>,
    pub session_id: Option<String>,
}

impl ActionRequest {
    pub fn new(operation_name: impl Into<String>, arguments: Value, phase: Phase) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Self {
            operation_name: operation_name.into(),
            arguments,
            phase,
            result_snapshot: None,
            session_id: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result_snapshot = Some(result);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// The same operation viewed from another phase
    pub fn for_phase(&self, phase: Phase) -> Self {
        let mut next = self.clone();
        next.phase = phase;
        next
    }

    /// String argument by key
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }

    /// Shell command carried by the request, if any
    pub fn command(&self) -> Option<&str> {
        self.arg_str("command").or_else(|| self.arg_str("cmd"))
    }

    /// Get a summary of the request for logging
    pub fn summary(&self) -> String {
        if let Some(command) = self.command() {
            let truncated: String = command.chars().take(100).collect();
            if truncated.len() < command.len() {
                return format!("{}: {}...", self.operation_name, truncated);
            }
            return format!("{}: {}", self.operation_name, truncated);
        }

        for key in crate::locks::PATH_ARGUMENT_KEYS {
            if let Some(path) = self.arg_str(key) {
                return format!("{}: {}", self.operation_name, path);
            }
        }

        self.operation_name.clone()
    }
}

/// Main input structure from Claude Code hooks
#[derive(Debug, Deserialize)]
pub struct HookInput {
    /// Name of the tool being invoked (e.g., "Bash", "Read", "Edit", "Write")
    pub tool_name: String,

    /// Tool-specific input parameters
    #[serde(default)]
    pub tool_input: Value,

    /// Tool result, present for PostToolUse
    #[serde(default)]
    pub tool_response: Option<Value>,

    /// Optional session identifier
    #[serde(default)]
    pub session_id: Option<String>,

    /// Hook event name (e.g., "PreToolUse")
    #[serde(default)]
    pub hook_event_name: Option<String>,
}

impl HookInput {
    /// Parse input from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Phase implied by the hook event, defaulting to pre
    pub fn phase(&self) -> Phase {
        self.hook_event_name
            .as_deref()
            .and_then(Phase::from_hook_event)
            .unwrap_or(Phase::Pre)
    }

    /// Convert into an action request, optionally forcing the phase
    pub fn into_request(self, phase_override: Option<Phase>) -> ActionRequest {
        let phase = phase_override.unwrap_or_else(|| self.phase());
        let mut request = ActionRequest::new(self.tool_name, self.tool_input, phase);
        request.result_snapshot = self.tool_response;
        request.session_id = self.session_id;
        request
    }
}
