//! Integration tests for the module lock registry
//!
//! Every test works on a real lock document in a temp directory.

use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tempfile::TempDir;

use policy_guardrails::audit::MemoryAuditSink;
use policy_guardrails::locks::{Access, LockError, LockModule, LockRegistry, LockTable};
use policy_guardrails::rules::store::{MemoryRuleSource, RuleCache};
use policy_guardrails::{ActionRequest, DecisionPipeline, Phase, SessionState};

const DOCUMENT: &str = r#"{
    "core": {
        "name": "Decision core",
        "locked": true,
        "locked_reason": "release freeze",
        "protected_paths": ["src/core/engine.rs"],
        "protected_symbols": ["evaluate_rules"]
    },
    "auth": {
        "locked": false,
        "protected_paths": ["src/auth/"]
    }
}"#;

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locks.json");
    std::fs::write(&path, DOCUMENT).unwrap();
    (dir, path)
}

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn write_to(registry: &LockRegistry, path: &str) -> bool {
    registry
        .check_operation("Write", &args(json!({"file_path": path, "content": "x"})))
        .blocked
}

fn stored_table(path: &Path) -> LockTable {
    LockTable::from_json(&std::fs::read_to_string(path).unwrap()).unwrap()
}

// ============================================================================
// Checks
// ============================================================================

#[test]
fn test_read_of_locked_file_allowed() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let decision = registry.check_operation("Read", &args(json!({"file_path": "src/core/engine.rs"})));
    assert!(!decision.blocked);
    assert_eq!(decision.access, Some(Access::Read));
}

#[test]
fn test_write_blocked_then_allowed_after_unlock() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let decision = registry.check_operation(
        "Write",
        &args(json!({"file_path": "src/core/engine.rs", "content": "fn main() {}"})),
    );
    assert!(decision.blocked);
    assert_eq!(decision.module_id.as_deref(), Some("core"));
    assert_eq!(decision.locked_reason.as_deref(), Some("release freeze"));

    let change = registry.unlock("core", "freeze over").unwrap();
    assert!(change.changed);
    assert!(!write_to(&registry, "src/core/engine.rs"));

    // Persisted, and a fresh registry sees it
    let core = stored_table(&path).get("core").cloned().unwrap();
    assert!(!core.locked);
    assert_eq!(core.unlocked_reason.as_deref(), Some("freeze over"));
    assert!(!write_to(&LockRegistry::load(&path).unwrap(), "src/core/engine.rs"));
}

#[test]
fn test_lock_is_idempotent_and_persists() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();
    assert!(!write_to(&registry, "src/auth/session.rs"));

    assert!(registry.lock("auth", "security review").unwrap().changed);
    assert!(!registry.lock("auth", "again").unwrap().changed);
    assert!(write_to(&registry, "src/auth/session.rs"));

    let auth = stored_table(&path).get("auth").cloned().unwrap();
    assert!(auth.locked);
    assert_eq!(auth.locked_reason.as_deref(), Some("security review"));
    assert!(auth.locked_at.is_some());
}

#[test]
fn test_unknown_module() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let err = registry.lock("billing", "x").unwrap_err();
    assert!(matches!(err, LockError::ModuleNotFound(ref id) if id == "billing"));
}

#[test]
fn test_symbol_edit_in_sibling_file_blocked() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let decision = registry.check_operation(
        "Edit",
        &args(json!({
            "file_path": "tests/engine_test.rs",
            "old_string": "let out = evaluate_rules(&rules);",
            "new_string": "let out = evaluate_rules(&[]);"
        })),
    );
    assert!(!decision.blocked, "different stem, not a sibling");

    let decision = registry.check_operation(
        "Edit",
        &args(json!({
            "file_path": "legacy/engine.py",
            "old_string": "evaluate_rules(&rules)",
            "new_string": "evaluate_rules(&[])"
        })),
    );
    assert!(decision.blocked);
    assert_eq!(decision.touched_symbols, vec!["evaluate_rules".to_string()]);
}

#[test]
fn test_shell_commands_checked() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let decision = registry.check_operation("Bash", &args(json!({"command": "rm src/core/engine.rs"})));
    assert!(decision.blocked);
    assert_eq!(decision.access, Some(Access::Delete));

    let decision = registry.check_operation("Bash", &args(json!({"command": "cat src/core/engine.rs"})));
    assert!(!decision.blocked);
}

#[test]
fn test_locked_file_named_after_other_targets_blocked() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let commands = [
        "touch /tmp/x && rm src/core/engine.rs",
        "rm -f /tmp/x src/core/engine.rs",
        "mv /tmp/evil.rs src/core/engine.rs",
        "echo hi > /tmp/log; echo pwned > src/core/engine.rs",
        "cat README.md | tee /tmp/copy src/core/engine.rs",
        "sudo chmod 644 /tmp/x src/core/engine.rs",
    ];
    for command in commands {
        let decision = registry.check_operation("Bash", &args(json!({"command": command})));
        assert!(decision.blocked, "{command}");
        assert_eq!(decision.module_id.as_deref(), Some("core"), "{command}");
        assert_eq!(decision.matched_path.as_deref(), Some("src/core/engine.rs"), "{command}");
    }

    let decision = registry.check_operation("Bash", &args(json!({"command": "mv /tmp/a.rs /tmp/b.rs"})));
    assert!(!decision.blocked);
    assert_eq!(decision.matched_path.as_deref(), Some("/tmp/a.rs"));
}

// ============================================================================
// Reload
// ============================================================================

#[test]
fn test_corrupt_reload_keeps_previous_state() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    std::fs::write(&path, "{ not json").unwrap();
    let err = registry.reload().unwrap_err();
    assert!(matches!(err, LockError::ConfigMalformed { .. }));

    assert!(write_to(&registry, "src/core/engine.rs"));
    assert_eq!(registry.modules().len(), 2);
}

#[test]
fn test_valid_edit_reflected_after_reload() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let edited = r#"{
        "core": {"locked": false, "protected_paths": ["src/core/engine.rs"]},
        "auth": {"locked": true, "protected_paths": ["src/auth/"]},
        "billing": {"locked": false, "protected_paths": ["src/billing/"]}
    }"#;
    std::fs::write(&path, edited).unwrap();

    let summary = registry.reload().unwrap();
    assert_eq!(summary.newly_unlocked, vec!["core".to_string()]);
    assert_eq!(summary.newly_locked, vec!["auth".to_string()]);
    assert_eq!(summary.added, vec!["billing".to_string()]);
    assert!(summary.removed.is_empty());
    assert_eq!(summary.to_string(), "1 locked, 1 unlocked, 1 added, 0 removed");

    assert!(!write_to(&registry, "src/core/engine.rs"));
    assert!(write_to(&registry, "src/auth/token.rs"));
}

#[test]
fn test_watcher_reloads_on_change() {
    let (_dir, path) = setup();
    let registry = Arc::new(LockRegistry::load(&path).unwrap());

    let (tx, rx) = mpsc::channel();
    let _watcher = registry
        .watch(Duration::from_millis(100), move |result| {
            let _ = tx.send(result.as_ref().cloned().map_err(|e| e.to_string()));
        })
        .unwrap()
        .expect("file-backed registry is watchable");

    std::thread::sleep(Duration::from_millis(100));
    std::fs::write(
        &path,
        r#"{"core": {"locked": false, "protected_paths": ["src/core/engine.rs"]}}"#,
    )
    .unwrap();

    // A write can surface as several bursts; wait for the first clean reload
    let summary = loop {
        match rx.recv_timeout(Duration::from_secs(5)).expect("reload callback") {
            Ok(summary) if !summary.is_empty() => break summary,
            _ => continue,
        }
    };
    assert_eq!(summary.newly_unlocked, vec!["core".to_string()]);
    assert_eq!(summary.removed, vec!["auth".to_string()]);
    assert!(!write_to(&registry, "src/core/engine.rs"));
}

#[test]
fn test_in_memory_registry_not_watchable() {
    let registry = Arc::new(LockRegistry::in_memory(Vec::new()));
    let watcher = registry.watch(Duration::from_millis(50), |_| {}).unwrap();
    assert!(watcher.is_none());
    assert!(registry.reload().unwrap().is_empty());
}

#[test]
fn test_checks_during_reloads() {
    let (_dir, path) = setup();
    let registry = Arc::new(LockRegistry::load(&path).unwrap());

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let registry = &registry;
            scope.spawn(move || {
                for _ in 0..200 {
                    // Lock state never changes, whichever table is current
                    assert!(write_to(registry, "src/core/engine.rs"));
                }
            });
        }
        for _ in 0..20 {
            registry.reload().unwrap();
        }
    });
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_register_module_persists() {
    let (_dir, path) = setup();
    let registry = LockRegistry::load(&path).unwrap();

    let module = LockModule::new("billing", vec!["src/billing/**/*.rs".to_string()])
        .with_name("Billing")
        .locked("audit in progress");
    assert!(registry.register_module(module.clone()).unwrap().changed);
    assert!(!registry.register_module(module).unwrap().changed);

    assert!(write_to(&registry, "src/billing/invoice/pdf.rs"));
    let stored = stored_table(&path);
    assert_eq!(stored.len(), 3);
    assert_eq!(stored.get("billing").map(|m| m.display_name.as_str()), Some("Billing"));
}

#[test]
fn test_missing_document_starts_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("locks.json");
    let registry = LockRegistry::load(&path).unwrap();
    assert!(registry.modules().is_empty());

    registry
        .register_module(LockModule::new("core", vec!["src/core/".to_string()]))
        .unwrap();
    assert!(path.exists());
}

#[test]
fn test_failed_persist_leaves_memory_untouched() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "").unwrap();
    let registry = LockRegistry::load(blocker.join("locks.json")).unwrap();

    let err = registry
        .register_module(LockModule::new("core", vec!["src/core/".to_string()]))
        .unwrap_err();
    assert!(matches!(err, LockError::Persist { .. }));
    assert!(registry.modules().is_empty());
}

// ============================================================================
// Pipeline integration
// ============================================================================

#[test]
fn test_lock_vetoes_before_rules() {
    let (_dir, path) = setup();
    let cache = RuleCache::new(Arc::new(MemoryRuleSource::new(Vec::new())), Duration::from_secs(60));
    let audit = Arc::new(MemoryAuditSink::new());
    let pipeline = DecisionPipeline::new(
        Arc::new(cache),
        Arc::new(LockRegistry::load(&path).unwrap()),
        audit.clone(),
    );

    let request = ActionRequest::new("Bash", json!({"command": "rm src/core/engine.rs"}), Phase::Pre);
    let decision = pipeline.evaluate(&request, &mut SessionState::default());

    assert!(decision.blocked);
    assert_eq!(decision.rule_code(), Some("lock:core"));
    let hit = decision.lock.expect("lock details");
    assert_eq!(hit.module_id, "core");
    assert_eq!(hit.access, Access::Delete);
    assert_eq!(audit.records()[0].rule_code, "lock:core");

    // Locks only veto in the pre phase
    let post = ActionRequest::new("Bash", json!({"command": "rm src/core/engine.rs"}), Phase::Post);
    assert!(pipeline.evaluate(&post, &mut SessionState::default()).is_allow());

    pipeline.locks().unlock("core", "done").unwrap();
    assert!(pipeline.evaluate(&request, &mut SessionState::default()).is_allow());
}
