//! Configuration loading for policy-guardrails
//!
//! Supports TOML configuration with embedded defaults.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// How decisions are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Blocks are returned as blocks
    #[default]
    Enforce,

    /// Blocks are downgraded to warnings (still audited)
    WarnOnly,

    /// Nothing is evaluated; every request is allowed
    Disabled,
}

impl Enforcement {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "enforce" => Some(Enforcement::Enforce),
            "warn_only" | "warn" => Some(Enforcement::WarnOnly),
            "disabled" | "off" => Some(Enforcement::Disabled),
            _ => None,
        }
    }

    /// Apply the GUARDRAILS_DISABLED / GUARDRAILS_WARN_ONLY overrides
    pub fn with_env_overrides(self) -> Self {
        if env::var("GUARDRAILS_DISABLED").is_ok() {
            Enforcement::Disabled
        } else if env::var("GUARDRAILS_WARN_ONLY").is_ok() {
            Enforcement::WarnOnly
        } else {
            self
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// General configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub enforcement: Enforcement,

    /// Directory holding per-session state files
    pub state_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enforcement: Enforcement::Enforce,
            state_dir: Some("~/.claude/guardrails/sessions".to_string()),
        }
    }
}

/// Audit log section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,

    /// Path to audit log file
    pub path: Option<String>,

    /// Also record evaluations that passed
    pub record_passes: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: Some("~/.claude/guardrails/audit.jsonl".to_string()),
            record_passes: false,
        }
    }
}

/// Rule store section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// TOML file holding `[[rule]]` entries
    pub path: Option<String>,

    pub cache_ttl_secs: u64,

    /// Invalidate the cache when the rules file changes
    pub watch: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: Some("~/.claude/guardrails/rules.toml".to_string()),
            cache_ttl_secs: 60,
            watch: false,
        }
    }
}

/// Lock registry section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// JSON document mapping module ids to lock state
    pub path: Option<String>,

    pub debounce_ms: u64,

    /// Hot-reload the document when it changes on disk
    pub watch: bool,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            path: Some("~/.claude/guardrails/locks.json".to_string()),
            debounce_ms: 300,
            watch: false,
        }
    }
}

/// Pipeline behaviour section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// After the first block, only rules of already-fired conflict groups are evaluated
    pub stop_at_first_block: bool,

    /// Shell commands whose post-phase result counts as a verification run
    pub verification_commands: Vec<String>,

    /// Commands that wrap other commands (unwrapped before path extraction)
    pub wrappers: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stop_at_first_block: true,
            verification_commands: vec![
                "cargo test".to_string(),
                "npm test".to_string(),
                "pytest".to_string(),
                "go test".to_string(),
            ],
            wrappers: crate::parser::wrapper::DEFAULT_WRAPPERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub audit: AuditConfig,
    pub rules: RulesConfig,
    pub locks: LocksConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from file or use defaults
    pub fn load() -> Self {
        let config_paths = [
            // User-specific config
            dirs::home_dir().map(|p| p.join(".claude/guardrails/config.toml")),
            // System-wide config
            Some(PathBuf::from("/etc/claude-guardrails/config.toml")),
        ];

        for path in config_paths.into_iter().flatten() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                    }
                }
            }
        }

        Config::default()
    }

    /// Load from a specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Expand ~ in path strings
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }

    /// Enforcement mode after environment overrides
    pub fn enforcement(&self) -> Enforcement {
        self.general.enforcement.with_env_overrides()
    }

    pub fn audit_path(&self) -> Option<PathBuf> {
        if !self.audit.enabled {
            return None;
        }
        self.audit.path.as_deref().map(Self::expand_path)
    }

    pub fn rules_path(&self) -> Option<PathBuf> {
        self.rules.path.as_deref().map(Self::expand_path)
    }

    pub fn locks_path(&self) -> Option<PathBuf> {
        self.locks.path.as_deref().map(Self::expand_path)
    }

    pub fn state_dir(&self) -> Option<PathBuf> {
        self.general.state_dir.as_deref().map(Self::expand_path)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rules.cache_ttl_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.locks.debounce_ms)
    }
}

/// Embedded default configuration
pub const DEFAULT_CONFIG_TOML: &str = r#"
[general]
enforcement = "enforce"
state_dir = "~/.claude/guardrails/sessions"

[audit]
enabled = true
path = "~/.claude/guardrails/audit.jsonl"
record_passes = false

[rules]
path = "~/.claude/guardrails/rules.toml"
cache_ttl_secs = 60
watch = false

[locks]
path = "~/.claude/guardrails/locks.json"
debounce_ms = 300
watch = false

[pipeline]
stop_at_first_block = true
verification_commands = ["cargo test", "npm test", "pytest", "go test"]
wrappers = ["sudo", "timeout", "xargs", "env", "nice", "nohup", "ionice", "strace", "time"]
"#;
