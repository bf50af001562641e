//! policy-guardrails - Rule-driven policy enforcement for agent tool calls
//!
//! Every operation an agent attempts is evaluated against persisted rules
//! before and after it runs. Rules that conflict are resolved
//! deterministically, and a module lock registry can veto changes to
//! specific files or functions whatever the rules say.
//!
//! # Features
//!
//! - **Rule store & cache**: TOML or in-memory rule sources behind a per-phase TTL cache
//! - **Detection**: flag, name, args, regex and api_call checks plus built-in handlers
//! - **Conflict resolution**: override, merge, highest_priority, first_match, custom
//! - **Module locks**: path and symbol level vetoes with hot reload
//! - **Audit logging**: JSONL log of every evaluation, secrets redacted
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use policy_guardrails::audit::NullAuditSink;
//! use policy_guardrails::locks::LockRegistry;
//! use policy_guardrails::rules::store::{MemoryRuleSource, RuleCache};
//! use policy_guardrails::rules::{DetectionType, PhaseScope, Rule};
//! use policy_guardrails::{ActionRequest, DecisionPipeline, Phase, SessionState};
//!
//! let rule = Rule::new("no-delete", PhaseScope::Pre, DetectionType::Name, json!("delete_file"));
//! let cache = RuleCache::new(Arc::new(MemoryRuleSource::new(vec![rule])), Duration::from_secs(60));
//! let pipeline = DecisionPipeline::new(
//!     Arc::new(cache),
//!     Arc::new(LockRegistry::in_memory(Vec::new())),
//!     Arc::new(NullAuditSink),
//! );
//!
//! let request = ActionRequest::new("delete_file", json!({"path": "/tmp/x"}), Phase::Pre);
//! let decision = pipeline.evaluate(&request, &mut SessionState::default());
//! assert!(decision.is_blocked());
//! assert_eq!(decision.rule_code(), Some("no-delete"));
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod input;
pub mod locks;
pub mod output;
pub mod parser;
pub mod rules;

// Re-exports for convenience
pub use config::{Config, Enforcement};
pub use engine::session::SessionState;
pub use engine::{DecisionPipeline, PipelineOptions};
pub use input::{ActionRequest, HookInput, Phase};
pub use locks::{LockDecision, LockRegistry};
pub use output::{Decision, HookOutput};
