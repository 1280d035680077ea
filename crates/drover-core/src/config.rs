use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.drover/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Config {
    /// Load config from `~/.drover/config.toml`, falling back to defaults
    /// when the file does not exist. Environment overrides are applied on
    /// top either way.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load from a specific path (no env overrides).
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".drover")
            .join("config.toml")
    }

    /// Apply the recognized environment-variable overrides on top of the
    /// file-loaded values. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        fn env_u64(key: &str) -> Option<u64> {
            let raw = std::env::var(key).ok()?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, raw = %raw, "ignoring unparseable env override");
                    None
                }
            }
        }

        if let Some(v) = env_u64("MAX_PARALLEL_PROJECTS") {
            self.scheduler.max_parallel_projects = v as usize;
        }
        if let Some(v) = env_u64("RETRY_COOLDOWN_MINUTES") {
            self.scheduler.retry_cooldown_minutes = v;
        }
        if let Some(v) = env_u64("RATE_LIMIT_COOLDOWN_MINUTES") {
            self.scheduler.rate_limit_cooldown_minutes = v;
        }
        if let Some(v) = env_u64("AUTO_REVIEW_DELAY_MINUTES") {
            self.review.auto_review_delay_minutes = v;
        }
        if let Some(v) = env_u64("REVIEW_DEADLINE_DAYS") {
            self.review.deadline_days = v;
        }
        if let Some(v) = env_u64("STUCK_TIMEOUT_MINUTES") {
            self.agent.stuck_timeout_minutes = v;
        }
        if let Some(v) = env_u64("WATCHDOG_INTERVAL_MINUTES") {
            self.watchdog.interval_minutes = v;
        }
        if let Some(v) = env_u64("SUMMARIZE_TOKEN_THRESHOLD") {
            self.summarizer.token_threshold = v as i64;
        }
        if let Some(v) = env_u64("CONTEXT_TOKEN_TARGET") {
            self.summarizer.context_token_target = v as i64;
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Installation-wide guidance file prepended to every prompt envelope.
    #[serde(default)]
    pub global_rules_path: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            global_rules_path: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.drover/drover.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// The external agent CLI binary.
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// Flag appended in autonomous mode so the agent never asks.
    #[serde(default = "default_skip_permissions_flag")]
    pub skip_permissions_flag: String,
    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Environment variables passed through from the daemon to the child
    /// (auth material the agent needs; nothing else crosses over).
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Hard per-session no-output ceiling.
    #[serde(default = "default_stuck_timeout_minutes")]
    pub stuck_timeout_minutes: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            skip_permissions_flag: default_skip_permissions_flag(),
            extra_args: Vec::new(),
            pass_env: default_pass_env(),
            kill_grace_secs: default_kill_grace_secs(),
            stuck_timeout_minutes: default_stuck_timeout_minutes(),
        }
    }
}

fn default_agent_binary() -> String {
    "claude".into()
}
fn default_skip_permissions_flag() -> String {
    "--dangerously-skip-permissions".into()
}
fn default_pass_env() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".into()]
}
fn default_kill_grace_secs() -> u64 {
    10
}
fn default_stuck_timeout_minutes() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global worker cap across all projects.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_projects: usize,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Backoff on generic failure.
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown_minutes: u64,
    /// Backoff on upstream 429/overload; does not consume a retry.
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_projects: default_max_parallel(),
            tick_secs: default_tick_secs(),
            retry_cooldown_minutes: default_retry_cooldown(),
            rate_limit_cooldown_minutes: default_rate_limit_cooldown(),
        }
    }
}

fn default_max_parallel() -> usize {
    3
}
fn default_tick_secs() -> u64 {
    2
}
fn default_retry_cooldown() -> u64 {
    5
}
fn default_rate_limit_cooldown() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_review_delay")]
    pub auto_review_delay_minutes: u64,
    /// Auto-close tickets stuck awaiting input for this long.
    #[serde(default = "default_review_deadline")]
    pub deadline_days: u64,
    #[serde(default = "default_true")]
    pub enforce_deadline: bool,
    /// Classifier retries before giving up conservatively.
    #[serde(default = "default_review_attempts")]
    pub max_attempts: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            auto_review_delay_minutes: default_review_delay(),
            deadline_days: default_review_deadline(),
            enforce_deadline: default_true(),
            max_attempts: default_review_attempts(),
        }
    }
}

fn default_review_delay() -> u64 {
    5
}
fn default_review_deadline() -> u64 {
    7
}
fn default_review_attempts() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "default_summarize_interval")]
    pub interval_minutes: u64,
    /// Unsummarized-token total that triggers compression.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: i64,
    /// Prompt envelope ceiling.
    #[serde(default = "default_context_target")]
    pub context_token_target: i64,
    /// Project map age before a regeneration is requested.
    #[serde(default = "default_map_ttl_hours")]
    pub map_ttl_hours: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_summarize_interval(),
            token_threshold: default_token_threshold(),
            context_token_target: default_context_target(),
            map_ttl_hours: default_map_ttl_hours(),
        }
    }
}

fn default_summarize_interval() -> u64 {
    5
}
fn default_token_threshold() -> i64 {
    50_000
}
fn default_context_target() -> i64 {
    150_000
}
fn default_map_ttl_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval")]
    pub interval_minutes: u64,
    /// Tickets with fewer messages than this are never inspected.
    #[serde(default = "default_watchdog_min_messages")]
    pub min_messages: usize,
    /// How many trailing messages the classifier sees.
    #[serde(default = "default_watchdog_window")]
    pub window: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_watchdog_interval(),
            min_messages: default_watchdog_min_messages(),
            window: default_watchdog_window(),
        }
    }
}

fn default_watchdog_interval() -> u64 {
    30
}
fn default_watchdog_min_messages() -> usize {
    10
}
fn default_watchdog_window() -> usize {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Outbound chat-channel webhook; notifications are dropped when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_true")]
    pub on_awaiting: bool,
    #[serde(default = "default_true")]
    pub on_failed: bool,
    #[serde(default = "default_true")]
    pub on_stuck: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            on_awaiting: default_true(),
            on_failed: default_true(),
            on_stuck: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Env var holding the Anthropic API key for classifier calls.
    #[serde(default = "default_key_env")]
    pub anthropic_key_env: String,
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    #[serde(default = "default_standard_model")]
    pub standard_model: String,
    #[serde(default = "default_premium_model")]
    pub premium_model: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic_key_env: default_key_env(),
            fast_model: default_fast_model(),
            standard_model: default_standard_model(),
            premium_model: default_premium_model(),
        }
    }
}

impl ProvidersConfig {
    /// Resolve a tier to a concrete model name.
    pub fn model_for(&self, tier: crate::types::ModelTier) -> &str {
        match tier {
            crate::types::ModelTier::Fast => &self.fast_model,
            crate::types::ModelTier::Standard => &self.standard_model,
            crate::types::ModelTier::Premium => &self.premium_model,
        }
    }
}

fn default_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_fast_model() -> String {
    "claude-haiku-4-5".into()
}
fn default_standard_model() -> String {
    "claude-sonnet-4-5".into()
}
fn default_premium_model() -> String {
    "claude-opus-4-5".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelTier;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.max_parallel_projects, 3);
        assert_eq!(cfg.scheduler.tick_secs, 2);
        assert_eq!(cfg.scheduler.retry_cooldown_minutes, 5);
        assert_eq!(cfg.scheduler.rate_limit_cooldown_minutes, 30);
        assert_eq!(cfg.review.auto_review_delay_minutes, 5);
        assert_eq!(cfg.review.deadline_days, 7);
        assert_eq!(cfg.agent.stuck_timeout_minutes, 30);
        assert_eq!(cfg.agent.kill_grace_secs, 10);
        assert_eq!(cfg.watchdog.interval_minutes, 30);
        assert_eq!(cfg.summarizer.token_threshold, 50_000);
        assert_eq!(cfg.summarizer.context_token_target, 150_000);
    }

    #[test]
    fn toml_round_trip() {
        let cfg = Config::default();
        let toml = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&toml).unwrap();
        assert_eq!(
            back.scheduler.max_parallel_projects,
            cfg.scheduler.max_parallel_projects
        );
        assert_eq!(back.agent.binary, cfg.agent.binary);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let text = r#"
            [scheduler]
            max_parallel_projects = 8
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.scheduler.max_parallel_projects, 8);
        assert_eq!(cfg.scheduler.tick_secs, 2);
        assert_eq!(cfg.review.auto_review_delay_minutes, 5);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = Config::load_from("/nonexistent/drover.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nbinary = \"mock-agent\"\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.agent.binary, "mock-agent");
    }

    #[test]
    fn model_tier_resolution() {
        let providers = ProvidersConfig::default();
        assert_eq!(providers.model_for(ModelTier::Fast), "claude-haiku-4-5");
        assert_eq!(
            providers.model_for(ModelTier::Premium),
            "claude-opus-4-5"
        );
    }
}
