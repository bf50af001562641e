//! Rule evaluation
//!
//! Registered built-in rule codes run their bespoke handler; everything else
//! goes through the generic detection dispatcher.

use super::detection::{self, RegexCache};
use super::session::SessionState;
use crate::input::ActionRequest;
use crate::parser::wrapper;
use crate::rules::builtin::BuiltinRegistry;
use crate::rules::{Rule, RuleKind};

/// A rule could not be evaluated; the pipeline treats this as a pass
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("malformed detection pattern: {0}")]
    Malformed(String),

    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },
}

impl EvaluationError {
    pub fn malformed(message: impl Into<String>) -> Self {
        EvaluationError::Malformed(message.into())
    }
}

pub struct Evaluator {
    builtins: BuiltinRegistry,
    regexes: RegexCache,
    /// Stripped before shell commands are matched against `args` checks
    wrappers: Vec<String>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(BuiltinRegistry::with_defaults())
    }
}

impl Evaluator {
    pub fn new(builtins: BuiltinRegistry) -> Self {
        Self {
            builtins,
            regexes: RegexCache::default(),
            wrappers: wrapper::DEFAULT_WRAPPERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_wrappers(mut self, wrappers: Vec<String>) -> Self {
        self.wrappers = wrappers;
        self
    }

    pub fn wrappers(&self) -> &[String] {
        &self.wrappers
    }

    pub fn kind_of(&self, rule: &Rule) -> RuleKind {
        self.builtins.kind_of(rule)
    }

    /// Whether `rule` is violated by `request`
    pub fn evaluate(
        &self,
        rule: &Rule,
        request: &ActionRequest,
        session: &SessionState,
    ) -> Result<bool, EvaluationError> {
        match self.kind_of(rule) {
            RuleKind::BuiltIn(handler) => handler.run(rule, request, session),
            RuleKind::Generic(detection_type) => detection::detect(
                detection_type,
                &rule.detection_pattern,
                request,
                session,
                &self.regexes,
                &self.wrappers,
            ),
        }
    }
}
