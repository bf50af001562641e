//! policy-guardrails - Policy enforcement hook for Claude Code
//!
//! # Usage
//!
//! ```bash
//! # As a Claude Code hook (reads JSON from stdin, writes JSON to stdout)
//! echo '{"tool_name":"delete_file","tool_input":{"path":"/etc/passwd"}}' | policy-guardrails
//!
//! # Dry-run mode (report blocks as warnings)
//! policy-guardrails --dry-run
//!
//! # Module lock administration
//! policy-guardrails lock core --reason "release freeze"
//! policy-guardrails unlock core
//! policy-guardrails locks
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use policy_guardrails::{
    config::{Config, Enforcement},
    input::{HookInput, Phase},
    locks::LockRegistry,
    output::HookOutput,
    rules::store::{RuleSource, TomlRuleSource},
    DecisionPipeline, SessionState,
};

#[derive(Debug, Parser)]
#[command(name = "policy-guardrails", version, about = "Policy enforcement hook for Claude Code tool calls")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Evaluate in this phase instead of the one implied by the hook event
    #[arg(short, long, value_parser = parse_phase)]
    phase: Option<Phase>,

    /// Report blocks as warnings
    #[arg(short, long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lock a module
    Lock {
        module_id: String,
        #[arg(short, long, default_value = "locked from the command line")]
        reason: String,
    },
    /// Unlock a module
    Unlock {
        module_id: String,
        #[arg(short, long, default_value = "unlocked from the command line")]
        reason: String,
    },
    /// List lock modules
    Locks,
    /// List rules, optionally only those active in one phase
    Rules {
        #[arg(long, value_parser = parse_phase)]
        phase: Option<Phase>,
    },
    /// Watch the rule and lock files and log reloads until interrupted
    Watch,
}

fn parse_phase(s: &str) -> Result<Phase, String> {
    Phase::from_str(s).ok_or_else(|| format!("unknown phase `{}` (pre, mid, post, response)", s))
}

/// Log to stderr; stdout carries hook JSON
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Config {
    match path {
        Some(path) => Config::load_from(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            Config::default()
        }),
        None => Config::load(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Some(Command::Watch) => "info",
        _ => "warn",
    };
    init_tracing(default_level);

    let mut config = load_config(cli.config.as_ref());
    if cli.dry_run && config.general.enforcement == Enforcement::Enforce {
        config.general.enforcement = Enforcement::WarnOnly;
    }

    match cli.command {
        None => run_hook(&config, cli.phase),
        Some(Command::Lock { module_id, reason }) => {
            let registry = open_registry(&config)?;
            let change = registry.lock(&module_id, &reason)?;
            if change.changed {
                println!("locked {}", module_id);
            } else {
                println!("{} was already locked", module_id);
            }
            Ok(())
        }
        Some(Command::Unlock { module_id, reason }) => {
            let registry = open_registry(&config)?;
            let change = registry.unlock(&module_id, &reason)?;
            if change.changed {
                println!("unlocked {}", module_id);
            } else {
                println!("{} was not locked", module_id);
            }
            Ok(())
        }
        Some(Command::Locks) => list_locks(&config),
        Some(Command::Rules { phase }) => list_rules(&config, phase),
        Some(Command::Watch) => watch(config),
    }
}

/// Read one hook event from stdin and answer on stdout
fn run_hook(config: &Config, phase: Option<Phase>) -> Result<()> {
    let mut input_json = String::new();
    io::stdin()
        .read_to_string(&mut input_json)
        .context("failed to read hook input")?;

    // No input = nothing to check, allow
    if input_json.trim().is_empty() {
        return emit(&HookOutput::allow());
    }

    let input = match HookInput::from_json(&input_json) {
        Ok(input) => input,
        Err(e) => {
            // Fail closed: malformed input could be an evasion attempt
            tracing::error!(error = %e, "failed to parse hook input, denying");
            return emit(&HookOutput::deny_with_rule(
                "parse-error",
                &format!("Failed to parse hook input: {}", e),
            ));
        }
    };

    let request = input.into_request(phase);
    let state_dir = config.state_dir();
    let mut session = match (&state_dir, &request.session_id) {
        (Some(dir), Some(id)) => SessionState::load(dir, id),
        _ => SessionState::new(request.session_id.clone()),
    };

    let pipeline = DecisionPipeline::from_config(config);
    let decision = pipeline.evaluate(&request, &mut session);
    tracing::debug!(
        operation = %request.summary(),
        blocked = decision.blocked,
        rule = ?decision.matched_rule_code,
        "decision"
    );

    if let Some(dir) = &state_dir {
        if let Err(e) = session.save(dir) {
            tracing::warn!(error = %e, "failed to persist session state");
        }
    }

    emit(&HookOutput::from_decision(&decision))
}

fn emit(output: &HookOutput) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", output.to_json())?;
    handle.flush()?;
    Ok(())
}

fn open_registry(config: &Config) -> Result<LockRegistry> {
    let path = config.locks_path().context("no [locks] path configured")?;
    let registry = LockRegistry::load(&path)
        .with_context(|| format!("failed to load lock config {}", path.display()))?;
    Ok(registry)
}

fn list_locks(config: &Config) -> Result<()> {
    let registry = open_registry(config)?;
    let modules = registry.modules();
    if modules.is_empty() {
        println!("no modules registered");
        return Ok(());
    }

    for module in modules {
        let state = if module.locked { "locked" } else { "unlocked" };
        println!("{:<20} {:<9} {}", module.module_id, state, module.protected_paths.join(", "));
        if let (true, Some(reason)) = (module.locked, &module.locked_reason) {
            println!("{:<20} reason: {}", "", reason);
        }
    }
    Ok(())
}

fn list_rules(config: &Config, phase: Option<Phase>) -> Result<()> {
    let path = config.rules_path().context("no [rules] path configured")?;
    let source = TomlRuleSource::new(path);
    let rules = match phase {
        Some(phase) => source.query_rules(phase)?,
        None => source.load_all()?,
    };

    for rule in rules {
        let enabled = if rule.enabled { "" } else { " (disabled)" };
        println!(
            "{:<24} prio {:>4}  {:?}/{}  group {}{}",
            rule.rule_code, rule.priority, rule.action_on_violation, rule.detection_type, rule.conflict_group, enabled
        );
    }
    Ok(())
}

fn watch(mut config: Config) -> Result<()> {
    config.rules.watch = true;
    config.locks.watch = true;

    let mut pipeline = DecisionPipeline::from_config(&config);
    pipeline.start_watchers(&config);
    if pipeline.watcher_count() == 0 {
        anyhow::bail!("nothing to watch: configure [rules] path or [locks] path");
    }

    tracing::info!(watchers = pipeline.watcher_count(), "watching for changes");
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
