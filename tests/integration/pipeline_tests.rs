//! Integration tests for the decision pipeline

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use policy_guardrails::audit::{MemoryAuditSink, Outcome};
use policy_guardrails::config::Config;
use policy_guardrails::locks::LockRegistry;
use policy_guardrails::rules::store::{MemoryRuleSource, RuleCache, RuleSource, StoreError};
use policy_guardrails::rules::{
    ActionOnViolation, ConflictStrategy, DetectionType, PhaseScope, Rule, Severity,
};
use policy_guardrails::{ActionRequest, DecisionPipeline, Phase, SessionState};

fn pipeline_with(rules: Vec<Rule>) -> (DecisionPipeline, Arc<MemoryAuditSink>) {
    let source = Arc::new(MemoryRuleSource::new(rules));
    pipeline_from_source(source)
}

fn pipeline_from_source(source: Arc<dyn RuleSource>) -> (DecisionPipeline, Arc<MemoryAuditSink>) {
    let cache = Arc::new(RuleCache::new(source, Duration::from_secs(60)));
    let audit = Arc::new(MemoryAuditSink::new());
    let pipeline = DecisionPipeline::new(
        cache,
        Arc::new(LockRegistry::in_memory(Vec::new())),
        audit.clone(),
    );
    (pipeline, audit)
}

fn r1_r2() -> Vec<Rule> {
    vec![
        Rule::new("R1", PhaseScope::Pre, DetectionType::Name, json!(["delete_file"]))
            .with_priority(10)
            .with_message("deleting files is not allowed"),
        Rule::new(
            "R2",
            PhaseScope::Pre,
            DetectionType::Args,
            json!({"forbidden_paths": ["/etc"]}),
        )
        .with_priority(5),
    ]
}

// ============================================================================
// End-to-end
// ============================================================================

#[test]
fn test_r1_r2_end_to_end() {
    let (pipeline, audit) = pipeline_with(r1_r2());
    let mut session = SessionState::default();
    let request = ActionRequest::new("delete_file", json!({"path": "/etc/passwd"}), Phase::Pre);

    let decision = pipeline.evaluate(&request, &mut session);

    assert!(decision.blocked);
    assert_eq!(decision.matched_rule_code.as_deref(), Some("R1"));
    assert_eq!(decision.message, "deleting files is not allowed");

    // Both fired, both audited once
    let records = audit.records();
    let codes: Vec<&str> = records.iter().map(|r| r.rule_code.as_str()).collect();
    assert_eq!(codes, vec!["R1", "R2"]);
    assert!(records.iter().all(|r| r.outcome == Outcome::Blocked));
    assert_eq!(session.stats.blocks, 2);
}

#[test]
fn test_r1_r2_unrelated_request_allowed() {
    let (pipeline, audit) = pipeline_with(r1_r2());
    let request = ActionRequest::new("read_file", json!({"path": "/home/me/notes.txt"}), Phase::Pre);

    let decision = pipeline.evaluate(&request, &mut SessionState::default());

    assert!(decision.is_allow());
    assert!(audit.records().is_empty());
}

#[test]
fn test_end_to_end_from_config_files() {
    let dir = TempDir::new().unwrap();
    let rules_path = dir.path().join("rules.toml");
    std::fs::write(
        &rules_path,
        r#"
        [[rule]]
        rule_code = "R1"
        phase_scope = "pre"
        priority = 10
        detection_type = "name"
        detection_pattern = ["delete_file"]

        [[rule]]
        rule_code = "R2"
        phase_scope = "pre"
        priority = 5
        detection_type = "args"
        detection_pattern = { forbidden_paths = ["/etc"] }
        "#,
    )
    .unwrap();
    let audit_path = dir.path().join("audit.jsonl");

    let mut config = Config::default();
    config.rules.path = Some(rules_path.display().to_string());
    config.locks.path = Some(dir.path().join("locks.json").display().to_string());
    config.audit.path = Some(audit_path.display().to_string());

    let pipeline = DecisionPipeline::from_config(&config);
    let request = ActionRequest::new("delete_file", json!({"path": "/etc/passwd"}), Phase::Pre)
        .with_session("s-1");
    let decision = pipeline.evaluate(&request, &mut SessionState::default());
    drop(pipeline);

    if config.enforcement() == policy_guardrails::Enforcement::Enforce {
        assert!(decision.blocked);
        assert_eq!(decision.rule_code(), Some("R1"));
    }

    let log = std::fs::read_to_string(&audit_path).unwrap();
    let lines: Vec<Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(!lines.is_empty());
    assert!(lines.iter().all(|l| l["session_id"] == "s-1"));
}

// ============================================================================
// Conflict resolution through the pipeline
// ============================================================================

#[test]
fn test_merge_group_produces_virtual_rule() {
    let rules = vec![
        Rule::new("A", PhaseScope::Pre, DetectionType::Name, json!("deploy"))
            .with_priority(3)
            .with_severity(Severity::Medium)
            .with_conflict("release", ConflictStrategy::Merge, 2),
        Rule::new("B", PhaseScope::Pre, DetectionType::Name, json!("deploy"))
            .with_priority(2)
            .with_severity(Severity::Critical)
            .with_conflict("release", ConflictStrategy::Merge, 7),
    ];
    let (pipeline, _audit) = pipeline_with(rules);

    let decision = pipeline.evaluate(
        &ActionRequest::new("deploy", json!({}), Phase::Pre),
        &mut SessionState::default(),
    );

    assert!(decision.blocked);
    assert_eq!(decision.rule_code(), Some("A+B"));
    assert_eq!(decision.severity, Some(Severity::Critical));
}

#[test]
fn test_override_group_picks_last_evaluated() {
    let rules = vec![
        Rule::new("FIRST", PhaseScope::Pre, DetectionType::Name, json!("deploy"))
            .with_priority(9)
            .with_conflict("default", ConflictStrategy::Override, 5),
        Rule::new("LAST", PhaseScope::All, DetectionType::Name, json!("deploy"))
            .with_priority(1)
            .with_conflict("default", ConflictStrategy::Override, 5),
    ];
    let (pipeline, _audit) = pipeline_with(rules);
    let request = ActionRequest::new("deploy", json!({}), Phase::Pre);

    for _ in 0..3 {
        let decision = pipeline.evaluate(&request, &mut SessionState::default());
        assert_eq!(decision.rule_code(), Some("LAST"));
    }
}

// ============================================================================
// Rule cache
// ============================================================================

#[test]
fn test_invalidation_picks_up_new_rules() {
    let source = Arc::new(MemoryRuleSource::new(Vec::new()));
    let (pipeline, _audit) = pipeline_from_source(source.clone());
    let request = ActionRequest::new("delete_file", json!({}), Phase::Pre);

    assert!(pipeline.evaluate(&request, &mut SessionState::default()).is_allow());

    source.replace(r1_r2());
    // Still cached
    assert!(pipeline.evaluate(&request, &mut SessionState::default()).is_allow());

    pipeline.cache().invalidate_all();
    assert!(pipeline.evaluate(&request, &mut SessionState::default()).is_blocked());

    let stats = pipeline.cache().stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.hits, 1);
}

struct SwitchableSource {
    rules: Vec<Rule>,
    down: AtomicBool,
}

impl RuleSource for SwitchableSource {
    fn query_rules(&self, phase: Phase) -> Result<Vec<Rule>, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(policy_guardrails::rules::store::select_rules(&self.rules, phase))
    }
}

#[test]
fn test_store_outage_keeps_last_good_rules() {
    let source = Arc::new(SwitchableSource {
        rules: r1_r2(),
        down: AtomicBool::new(false),
    });
    let (pipeline, _audit) = pipeline_from_source(source.clone());
    let request = ActionRequest::new("delete_file", json!({"path": "/etc/passwd"}), Phase::Pre);

    assert!(pipeline.evaluate(&request, &mut SessionState::default()).is_blocked());

    source.down.store(true, Ordering::SeqCst);
    pipeline.cache().invalidate_all();
    assert!(pipeline.evaluate(&request, &mut SessionState::default()).is_blocked());
    assert_eq!(pipeline.cache().stats().store_errors, 1);
}

#[test]
fn test_store_outage_without_history_allows() {
    let source = Arc::new(SwitchableSource {
        rules: r1_r2(),
        down: AtomicBool::new(true),
    });
    let (pipeline, _audit) = pipeline_from_source(source);
    let request = ActionRequest::new("delete_file", json!({"path": "/etc/passwd"}), Phase::Pre);

    assert!(pipeline.evaluate(&request, &mut SessionState::default()).is_allow());
}

// ============================================================================
// Session-driven rules
// ============================================================================

#[test]
fn test_verification_streak_unlocks_commit() {
    let rule = Rule::new(
        "verification-streak",
        PhaseScope::Pre,
        DetectionType::Flag,
        json!({"operations": ["git_commit"], "required": 2}),
    )
    .with_message("run the test suite twice before committing");
    let (pipeline, _audit) = pipeline_with(vec![rule]);
    let mut session = SessionState::new(Some("s".to_string()));
    let commit = ActionRequest::new("git_commit", json!({}), Phase::Pre);

    assert!(pipeline.evaluate(&commit, &mut session).is_blocked());

    let run = ActionRequest::new("Bash", json!({"command": "cargo test"}), Phase::Post)
        .with_result(json!({"exit_code": 0}));
    pipeline.evaluate(&run, &mut session);
    assert!(pipeline.evaluate(&commit, &mut session).is_blocked());

    pipeline.evaluate(&run, &mut session);
    assert!(pipeline.evaluate(&commit, &mut session).is_allow());
}

#[test]
fn test_read_before_edit_flow() {
    let rule = Rule::new("read-before-edit", PhaseScope::Pre, DetectionType::Flag, json!({}))
        .with_suggestion("read the file first");
    let (pipeline, _audit) = pipeline_with(vec![rule]);
    let mut session = SessionState::default();
    let edit = ActionRequest::new(
        "Edit",
        json!({"file_path": "src/lib.rs", "old_string": "a", "new_string": "b"}),
        Phase::Pre,
    );

    let decision = pipeline.evaluate(&edit, &mut session);
    assert!(decision.is_blocked());
    assert_eq!(decision.suggestion.as_deref(), Some("read the file first"));

    let read = ActionRequest::new("Read", json!({"file_path": "./src/lib.rs"}), Phase::Post);
    pipeline.evaluate(&read, &mut session);

    assert!(pipeline.evaluate(&edit, &mut session).is_allow());
}

#[test]
fn test_flag_rule_follows_session_flags() {
    let rule = Rule::new(
        "needs-review",
        PhaseScope::Pre,
        DetectionType::Flag,
        json!({"flag": "reviewed", "expected": true}),
    )
    .with_action(ActionOnViolation::Warn);
    let (pipeline, _audit) = pipeline_with(vec![rule]);
    let mut session = SessionState::default();
    let request = ActionRequest::new("merge", json!({}), Phase::Pre);

    let decision = pipeline.evaluate(&request, &mut session);
    assert!(decision.is_allow());
    assert_eq!(decision.warnings, vec!["needs-review".to_string()]);

    session.set_flag("reviewed", json!(true));
    let decision = pipeline.evaluate(&request, &mut session);
    assert!(decision.warnings.is_empty());
}

#[test]
fn test_session_state_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut session = SessionState::new(Some("abc/123".to_string()));
    session.record_read("src/main.rs");
    session.record_verification(true);
    session.set_flag("reviewed", json!(true));
    session.stats.blocks = 4;
    session.save(dir.path()).unwrap();

    let loaded = SessionState::load(dir.path(), "abc/123");
    assert!(loaded.has_read("src/main.rs"));
    assert_eq!(loaded.verification_streak(), 1);
    assert_eq!(loaded.flag("reviewed"), Some(&json!(true)));
    assert_eq!(loaded.stats.blocks, 4);

    let fresh = SessionState::load(dir.path(), "unknown");
    assert_eq!(fresh.session_id.as_deref(), Some("unknown"));
    assert_eq!(fresh.verification_streak(), 0);
}
