//! Shell parsing utilities for policy-guardrails
//!
//! Provides shell tokenization, wrapper command unwrapping, AST-based
//! analysis, and file target extraction from free-text commands.

pub mod ast;
pub mod path;
pub mod shell;
pub mod wrapper;

pub use path::{extract_target, extract_targets, ShellTarget};
