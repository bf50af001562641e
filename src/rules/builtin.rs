//! Built-in rule handlers
//!
//! Some rules cannot be written in the generic detection grammar. Their
//! codes are registered here explicitly; the evaluator routes them to a
//! handler instead of the generic dispatcher.

use serde_json::Value;
use std::collections::HashMap;

use super::{Rule, RuleKind};
use crate::engine::evaluator::EvaluationError;
use crate::engine::session::SessionState;
use crate::input::ActionRequest;
use crate::locks;

/// Bespoke handlers known to the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinId {
    /// Require N consecutive successful verification runs before listed operations
    VerificationStreak,
    /// Require a file to be read in this session before it is patched
    ReadBeforeEdit,
}

impl BuiltinId {
    pub fn run(
        &self,
        rule: &Rule,
        request: &ActionRequest,
        session: &SessionState,
    ) -> Result<bool, EvaluationError> {
        match self {
            BuiltinId::VerificationStreak => verification_streak(rule, request, session),
            BuiltinId::ReadBeforeEdit => read_before_edit(rule, request, session),
        }
    }
}

/// Rule code -> handler table
#[derive(Debug, Clone, Default)]
pub struct BuiltinRegistry {
    handlers: HashMap<String, BuiltinId>,
}

impl BuiltinRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the shipped handlers under their canonical codes
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("verification-streak", BuiltinId::VerificationStreak);
        registry.register("read-before-edit", BuiltinId::ReadBeforeEdit);
        registry
    }

    pub fn register(&mut self, rule_code: impl Into<String>, id: BuiltinId) {
        self.handlers.insert(rule_code.into(), id);
    }

    pub fn kind_of(&self, rule: &Rule) -> RuleKind {
        match self.handlers.get(&rule.rule_code) {
            Some(id) => RuleKind::BuiltIn(*id),
            None => RuleKind::Generic(rule.detection_type),
        }
    }
}

fn operation_listed(pattern: &Value, operation: &str) -> Result<bool, EvaluationError> {
    match pattern.get("operations") {
        None => Ok(true),
        Some(Value::Array(ops)) => Ok(ops.iter().any(|op| op.as_str() == Some(operation))),
        Some(_) => Err(EvaluationError::malformed("operations must be an array")),
    }
}

fn verification_streak(
    rule: &Rule,
    request: &ActionRequest,
    session: &SessionState,
) -> Result<bool, EvaluationError> {
    let pattern = &rule.detection_pattern;
    let required = pattern
        .get("required")
        .and_then(Value::as_u64)
        .ok_or_else(|| EvaluationError::malformed("verification-streak needs a numeric `required`"))?;

    if !operation_listed(pattern, &request.operation_name)? {
        return Ok(false);
    }

    Ok(u64::from(session.verification_streak()) < required)
}

fn read_before_edit(
    rule: &Rule,
    request: &ActionRequest,
    session: &SessionState,
) -> Result<bool, EvaluationError> {
    if !operation_listed(&rule.detection_pattern, &request.operation_name)? {
        return Ok(false);
    }

    if !locks::is_patch_operation(&request.arguments) {
        return Ok(false);
    }

    match locks::path_argument(&request.arguments) {
        Some(path) => Ok(!session.has_read(path)),
        None => Ok(false),
    }
}
