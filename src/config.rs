//! Configuration loading and runtime path resolution.
//!
//! A single `armitage.toml` holds all tunable knobs. Every section has
//! serde defaults so an empty file yields a working runtime.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level runtime configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Core runtime limits.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Memory tier tuning.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Priority task queue tuning.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Background scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Poller intervals and classification knobs.
    #[serde(default)]
    pub pollers: PollersConfig,

    /// Tool invocation limits.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Token budget limits for background LLM work.
    #[serde(default)]
    pub budget: BudgetConfig,
}

/// Core runtime limits.
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum concurrent background workers.
    #[serde(default = "default_worker_cap")]
    pub worker_cap: usize,

    /// End-to-end deadline for a user request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Override for the runtime data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_cap: default_worker_cap(),
            request_timeout_secs: default_request_timeout_secs(),
            data_dir: None,
        }
    }
}

/// Memory tier tuning.
#[derive(Debug, Deserialize)]
pub struct MemoryConfig {
    /// Short-term ring capacity per session.
    #[serde(default = "default_short_term_window")]
    pub short_term_window: usize,

    /// Medium-term note time-to-live, in days.
    #[serde(default = "default_medium_ttl_days")]
    pub medium_ttl_days: i64,

    /// Weight of the semantic score in hybrid ranking (the keyword score
    /// gets the complement).
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: default_short_term_window(),
            medium_ttl_days: default_medium_ttl_days(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

/// Priority task queue tuning.
#[derive(Debug, Deserialize)]
pub struct QueueConfig {
    /// Soft cap on total queued tasks; `info`/`low` tasks are shed above it.
    #[serde(default = "default_queue_soft_cap")]
    pub soft_cap: usize,

    /// Consumer lease duration, in seconds. An in-flight task whose lease
    /// expires without completion is reclaimed.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            soft_cap: default_queue_soft_cap(),
            lease_secs: default_lease_secs(),
        }
    }
}

/// Background scheduler tuning.
#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler wake interval, in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Grace period for in-flight handlers at shutdown, in seconds.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            handler_timeout_secs: default_handler_timeout_secs(),
        }
    }
}

/// Poller intervals and classification knobs.
#[derive(Debug, Deserialize)]
pub struct PollersConfig {
    /// Email poll interval, in seconds.
    #[serde(default = "default_email_interval_secs")]
    pub email_interval_secs: u64,

    /// Calendar poll interval, in seconds.
    #[serde(default = "default_calendar_interval_secs")]
    pub calendar_interval_secs: u64,

    /// Service-health probe interval, in seconds.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Subject tokens that mark an email as high priority.
    #[serde(default = "default_urgency_tokens")]
    pub urgency_tokens: Vec<String>,
}

impl Default for PollersConfig {
    fn default() -> Self {
        Self {
            email_interval_secs: default_email_interval_secs(),
            calendar_interval_secs: default_calendar_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
            urgency_tokens: default_urgency_tokens(),
        }
    }
}

/// Tool invocation limits.
#[derive(Debug, Deserialize)]
pub struct ToolsConfig {
    /// Default per-tool timeout, in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Hard ceiling a tool may raise its timeout to, in seconds.
    #[serde(default = "default_tool_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Maximum attempts for retriable tool errors.
    #[serde(default = "default_tool_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_tool_timeout_secs(),
            max_timeout_secs: default_tool_max_timeout_secs(),
            max_attempts: default_tool_max_attempts(),
        }
    }
}

/// Token budget limits for background LLM work.
#[derive(Debug, Deserialize)]
pub struct BudgetConfig {
    /// Maximum tokens the runtime may spend per day on background LLM work
    /// (knowledge extraction, integrity checks).
    #[serde(default = "default_daily_tokens")]
    pub max_tokens_per_day: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_day: default_daily_tokens(),
        }
    }
}

/// Resolved filesystem locations for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Runtime directory (`~/.local/share/armitage` unless overridden).
    pub root: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Health JSON snapshot path.
    pub health_json: PathBuf,
}

// Default value functions for serde

fn default_worker_cap() -> usize {
    64
}
fn default_request_timeout_secs() -> u64 {
    600
}
fn default_short_term_window() -> usize {
    20
}
fn default_medium_ttl_days() -> i64 {
    30
}
fn default_hybrid_alpha() -> f64 {
    0.7
}
fn default_queue_soft_cap() -> usize {
    10_000
}
fn default_lease_secs() -> u64 {
    300
}
fn default_tick_secs() -> u64 {
    1
}
fn default_handler_timeout_secs() -> u64 {
    30
}
fn default_email_interval_secs() -> u64 {
    120
}
fn default_calendar_interval_secs() -> u64 {
    60
}
fn default_health_interval_secs() -> u64 {
    30
}
fn default_urgency_tokens() -> Vec<String> {
    ["urgent", "asap", "immediately", "critical", "action required"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_tool_max_timeout_secs() -> u64 {
    600
}
fn default_tool_max_attempts() -> u32 {
    3
}
fn default_daily_tokens() -> u64 {
    5_000_000
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve runtime paths, creating the root directory if needed.
///
/// The root is `config.runtime.data_dir` when set, otherwise the platform
/// data directory for "armitage".
///
/// # Errors
///
/// Returns an error if no data directory can be determined or created.
pub fn runtime_paths(config: &Config) -> anyhow::Result<RuntimePaths> {
    let root = match &config.runtime.data_dir {
        Some(dir) => dir.clone(),
        None => directories::ProjectDirs::from("", "", "armitage")
            .ok_or_else(|| anyhow::anyhow!("could not determine a data directory"))?
            .data_dir()
            .to_path_buf(),
    };

    std::fs::create_dir_all(&root)
        .map_err(|e| anyhow::anyhow!("failed to create data dir {}: {e}", root.display()))?;

    Ok(RuntimePaths {
        logs_dir: root.join("logs"),
        db_path: root.join("armitage.db"),
        health_json: root.join("health.json"),
        root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.runtime.worker_cap, 64);
        assert_eq!(config.memory.short_term_window, 20);
        assert_eq!(config.memory.medium_ttl_days, 30);
        assert!((config.memory.hybrid_alpha - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.queue.soft_cap, 10_000);
        assert_eq!(config.queue.lease_secs, 300);
        assert_eq!(config.scheduler.tick_secs, 1);
        assert_eq!(config.tools.default_timeout_secs, 60);
        assert_eq!(config.tools.max_attempts, 3);
    }

    #[test]
    fn test_partial_config_overrides() {
        let toml = r#"
            [queue]
            soft_cap = 500

            [memory]
            short_term_window = 10
        "#;
        let config: Config = toml::from_str(toml).expect("parse");
        assert_eq!(config.queue.soft_cap, 500);
        assert_eq!(config.queue.lease_secs, 300, "unset keys keep defaults");
        assert_eq!(config.memory.short_term_window, 10);
    }

    #[test]
    fn test_urgency_tokens_default_nonempty() {
        let config = Config::default();
        assert!(config.pollers.urgency_tokens.contains(&"urgent".to_owned()));
    }

    #[test]
    fn test_unknown_section_rejected_gracefully() {
        // Unknown sections are ignored by serde (no deny_unknown_fields),
        // matching the tolerance needed for config forward-compatibility.
        let config: Config = toml::from_str("[future]\nx = 1\n").expect("parse");
        assert_eq!(config.runtime.worker_cap, 64);
    }
}
