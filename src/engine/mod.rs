//! Decision pipeline for policy-guardrails
//!
//! Runs one action request through the lock check, the phase's rules and
//! conflict resolution, audits what it evaluated, and returns a Decision.

pub mod conflict;
pub mod detection;
pub mod evaluator;
pub mod session;

use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::audit::{AuditRecord, AuditSink, JsonlAuditSink, NullAuditSink, Outcome};
use crate::config::{Config, Enforcement};
use crate::input::{ActionRequest, Phase};
use crate::locks::{self, Access, ConfigWatcher, LockDecision, LockRegistry};
use crate::output::{Decision, LockHit};
use crate::parser;
use crate::rules::store::{MemoryRuleSource, RuleCache, RuleSource, TomlRuleSource};
use crate::rules::{ActionOnViolation, Rule, Severity};
use conflict::{ConflictResolver, ResolutionContext};
use evaluator::Evaluator;
use session::SessionState;

/// Pipeline switches taken from `[general]`, `[audit]` and `[pipeline]`
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub enforcement: Enforcement,
    pub stop_at_first_block: bool,
    pub record_passes: bool,
    pub verification_commands: Vec<String>,
    pub wrappers: Vec<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enforcement: config.enforcement(),
            stop_at_first_block: config.pipeline.stop_at_first_block,
            record_passes: config.audit.record_passes,
            verification_commands: config.pipeline.verification_commands.clone(),
            wrappers: config.pipeline.wrappers.clone(),
        }
    }
}

/// The main policy engine
pub struct DecisionPipeline {
    cache: Arc<RuleCache>,
    locks: Arc<LockRegistry>,
    evaluator: Evaluator,
    resolver: ConflictResolver,
    audit: Arc<dyn AuditSink>,
    options: PipelineOptions,
    watchers: Vec<ConfigWatcher>,
}

impl DecisionPipeline {
    pub fn new(cache: Arc<RuleCache>, locks: Arc<LockRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            cache,
            locks,
            evaluator: Evaluator::default(),
            resolver: ConflictResolver::default(),
            audit,
            options: PipelineOptions::default(),
            watchers: Vec::new(),
        }
    }

    /// Build every component from configuration
    ///
    /// Unusable rule, lock or audit files degrade to empty or null
    /// components with a warning rather than failing the hook.
    pub fn from_config(config: &Config) -> Self {
        let source: Arc<dyn RuleSource> = match config.rules_path() {
            Some(path) => Arc::new(TomlRuleSource::new(path)),
            None => Arc::new(MemoryRuleSource::new(Vec::new())),
        };
        let cache = Arc::new(RuleCache::new(source, config.cache_ttl()));

        let registry = match config.locks_path() {
            Some(path) => LockRegistry::load(&path).unwrap_or_else(|e| {
                warn!(error = %e, "lock registry unavailable, continuing without locks");
                LockRegistry::in_memory(Vec::new())
            }),
            None => LockRegistry::in_memory(Vec::new()),
        };
        let registry = Arc::new(registry.with_wrappers(config.pipeline.wrappers.clone()));

        let audit: Arc<dyn AuditSink> = match config.audit_path() {
            Some(path) => match JsonlAuditSink::open(&path) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "audit log unavailable");
                    Arc::new(NullAuditSink)
                }
            },
            None => Arc::new(NullAuditSink),
        };

        Self::new(cache, registry, audit).with_options(PipelineOptions::from_config(config))
    }

    /// Replace the options; the evaluator picks up their wrapper list
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.evaluator = std::mem::take(&mut self.evaluator).with_wrappers(options.wrappers.clone());
        self.options = options;
        self
    }

    /// Replace the evaluator, keeping the configured wrapper list
    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator.with_wrappers(self.options.wrappers.clone());
        self
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Start the `[rules] watch` and `[locks] watch` file watchers
    pub fn start_watchers(&mut self, config: &Config) {
        if config.rules.watch {
            if let Some(path) = config.rules_path() {
                let cache: Weak<RuleCache> = Arc::downgrade(&self.cache);
                match ConfigWatcher::spawn(&path, config.debounce(), move || {
                    if let Some(cache) = cache.upgrade() {
                        cache.invalidate_all();
                    }
                }) {
                    Ok(watcher) => self.watchers.push(watcher),
                    Err(e) => warn!(path = %path.display(), error = %e, "cannot watch rules file"),
                }
            }
        }

        if config.locks.watch {
            let watched = self.locks.watch(config.debounce(), |result| match result {
                Ok(summary) if !summary.is_empty() => info!(%summary, "locks changed"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "lock reload rejected"),
            });
            match watched {
                Ok(Some(watcher)) => self.watchers.push(watcher),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cannot watch lock config"),
            }
        }
    }

    pub fn cache(&self) -> &Arc<RuleCache> {
        &self.cache
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Number of running file watchers
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Main entry point: evaluate one request in its phase
    pub fn evaluate(&self, request: &ActionRequest, session: &mut SessionState) -> Decision {
        let decision = self.decide(request, session);
        if request.phase == Phase::Post {
            self.record_post_effects(request, session);
        }
        decision
    }

    fn decide(&self, request: &ActionRequest, session: &mut SessionState) -> Decision {
        let phase = request.phase;

        if self.options.enforcement == Enforcement::Disabled {
            self.audit_record(request, "-", Outcome::Passed, "disabled");
            return Decision::allow(phase, "guardrails disabled");
        }

        if phase == Phase::Pre {
            let lock = self.locks.check_operation(&request.operation_name, &request.arguments);
            if lock.blocked {
                return self.lock_decision(request, session, lock);
            }
        }

        let rules = self.cache.load_rules(phase);
        let may_block = phase.can_block();
        let mut fired: Vec<&Rule> = Vec::new();
        let mut fired_groups: HashSet<&str> = HashSet::new();
        let mut warned: Vec<&Rule> = Vec::new();

        for rule in rules.iter() {
            if self.options.stop_at_first_block
                && !fired.is_empty()
                && !fired_groups.contains(rule.conflict_group.as_str())
            {
                continue;
            }

            let violated = match self.evaluator.evaluate(rule, request, session) {
                Ok(violated) => violated,
                Err(e) => {
                    warn!(rule = %rule.rule_code, error = %e, "rule evaluation failed, treating as pass");
                    session.count_error();
                    self.audit_record(request, &rule.rule_code, Outcome::Error, &e.to_string());
                    continue;
                }
            };

            if !violated {
                session.count_evaluation(None);
                if self.options.record_passes {
                    self.audit_record(request, &rule.rule_code, Outcome::Passed, "not violated");
                }
                continue;
            }

            debug!(rule = %rule.rule_code, action = ?rule.action_on_violation, phase = %phase, "rule violated");
            session.count_evaluation(Some(rule.action_on_violation));

            match rule.action_on_violation {
                ActionOnViolation::Block if may_block => {
                    fired.push(rule);
                    fired_groups.insert(rule.conflict_group.as_str());
                }
                ActionOnViolation::Block => {
                    warned.push(rule);
                    let reason = format!("{} (not blocking in {} phase)", rule.display_message(), phase);
                    self.audit_record(request, &rule.rule_code, Outcome::Warned, &reason);
                }
                ActionOnViolation::Warn => {
                    warned.push(rule);
                    self.audit_record(request, &rule.rule_code, Outcome::Warned, &rule.display_message());
                }
                ActionOnViolation::Log => {
                    warned.push(rule);
                    self.audit_record(request, &rule.rule_code, Outcome::Logged, &rule.display_message());
                }
            }
        }

        let warnings: Vec<String> = warned.iter().map(|rule| rule.rule_code.clone()).collect();

        if fired.is_empty() {
            let Some(first) = warned.first() else {
                return Decision::allow(phase, "no rules violated");
            };
            let mut decision = Decision::warn(phase, first.rule_code.clone(), first.display_message())
                .with_suggestion(first.suggestion.clone())
                .with_severity(first.severity);
            decision.warnings = warnings;
            return decision;
        }

        let fired: Vec<Rule> = fired.into_iter().cloned().collect();
        let ctx = ResolutionContext {
            phase,
            operation_name: request.operation_name.clone(),
        };
        let Some(resolution) = self.resolver.resolve(&fired, &ctx) else {
            return Decision::allow(phase, "no rules violated");
        };
        let is_conflict = resolution.is_conflict();
        let winner = resolution.winner;

        let enforce = self.options.enforcement == Enforcement::Enforce;
        let outcome = if enforce { Outcome::Blocked } else { Outcome::Warned };
        for rule in &fired {
            let reason = if rule.rule_code == winner.rule_code || !is_conflict {
                rule.display_message()
            } else {
                format!("{} (resolved in favour of {})", rule.display_message(), winner.rule_code)
            };
            self.audit_record(request, &rule.rule_code, outcome, &reason);
        }

        let mut decision = Decision::block(phase, winner.rule_code.clone(), winner.display_message())
            .with_suggestion(winner.suggestion.clone())
            .with_severity(winner.severity);
        decision.warnings = warnings;

        if enforce {
            decision
        } else {
            decision.into_warning()
        }
    }

    fn lock_decision(&self, request: &ActionRequest, session: &mut SessionState, lock: LockDecision) -> Decision {
        let phase = request.phase;
        let module_id = lock.module_id.unwrap_or_default();
        let rule_code = format!("lock:{}", module_id);
        let enforce = self.options.enforcement == Enforcement::Enforce;

        session.count_evaluation(Some(ActionOnViolation::Block));
        let outcome = if enforce { Outcome::Blocked } else { Outcome::Warned };
        self.audit_record(request, &rule_code, outcome, &lock.message);

        let mut decision = Decision::block(phase, rule_code, lock.message)
            .with_suggestion(lock.suggestion)
            .with_severity(Severity::High);
        decision.lock = Some(LockHit {
            module_id,
            matched_path: lock.matched_path.unwrap_or_default(),
            access: lock.access.unwrap_or(Access::Write),
            touched_symbols: lock.touched_symbols,
            locked_reason: lock.locked_reason,
            locked_at: lock.locked_at,
        });

        if enforce {
            decision
        } else {
            decision.into_warning()
        }
    }

    /// Session bookkeeping once an operation has run
    fn record_post_effects(&self, request: &ActionRequest, session: &mut SessionState) {
        if let Some(path) = self.read_target(request) {
            debug!(path = %path, "recording file read");
            session.record_read(&path);
        }

        let Some(command) = request.command() else {
            return;
        };
        if !self.is_verification_command(command) {
            return;
        }
        if let Some(success) = request.result_snapshot.as_ref().map(run_succeeded) {
            session.record_verification(success);
            debug!(success, streak = session.verification_streak(), "verification run recorded");
        }
    }

    fn read_target(&self, request: &ActionRequest) -> Option<String> {
        if let Some(path) = locks::path_argument(&request.arguments) {
            let access = locks::classify_operation(&request.operation_name, &request.arguments);
            return (access == Access::Read).then(|| path.to_string());
        }

        let target = parser::extract_target(request.command()?, &self.options.wrappers)?;
        (target.access == Access::Read).then_some(target.path)
    }

    fn is_verification_command(&self, command: &str) -> bool {
        parser::shell::split_compound_command(command).iter().any(|part| {
            let argv = parser::wrapper::unwrap_command(part, &self.options.wrappers).unwrap_or_default();
            let line = argv.join(" ");
            self.options
                .verification_commands
                .iter()
                .any(|verification| line == *verification || line.starts_with(&format!("{} ", verification)))
        })
    }

    fn audit_record(&self, request: &ActionRequest, rule_code: &str, outcome: Outcome, reason: &str) {
        let record = AuditRecord::new(rule_code, &request.operation_name, request.phase, outcome, reason)
            .with_session(request.session_id.clone());
        if let Err(e) = self.audit.append(&record) {
            warn!(error = %e, rule = rule_code, "failed to write audit record");
        }
    }
}

/// Whether a tool result reports success
fn run_succeeded(result: &Value) -> bool {
    let Some(fields) = result.as_object() else {
        return true;
    };

    for key in ["exit_code", "exitCode", "returncode"] {
        if let Some(code) = fields.get(key).and_then(Value::as_i64) {
            return code == 0;
        }
    }
    if let Some(success) = fields.get("success").and_then(Value::as_bool) {
        return success;
    }
    if let Some(is_error) = fields.get("is_error").and_then(Value::as_bool) {
        return !is_error;
    }
    if let Some(interrupted) = fields.get("interrupted").and_then(Value::as_bool) {
        return !interrupted;
    }
    true
}
