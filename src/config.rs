//! Layered configuration (§6.4 tunables plus the ambient logging/server knobs).

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tmux_prefix: String,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub safety_net: SafetyNetConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rest_api: RestApiConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Operator-configured credential profiles (§4.1 "subscription"). Not
    /// created through the HTTP API — only `GET /subscriptions` (a list)
    /// is exposed, never a write path, so these are administered the same
    /// way as every other tunable: config file + env layering.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionDef>,
}

/// A named credential profile an agent can be pinned to at create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDef {
    pub id: String,
    pub provider: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// claude-code: when equal to the default `~/.claude`, `CLAUDE_CONFIG_DIR`
    /// is left unset; otherwise it is set to this value.
    #[serde(default)]
    pub source_dir: Option<String>,
    /// claude-code: path to a file whose contents become `CLAUDE_CODE_OAUTH_TOKEN`.
    #[serde(default)]
    pub token_file: Option<String>,
    /// codex: upserted into the copied `config.toml` when set.
    #[serde(default)]
    pub forced_chatgpt_workspace_id: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub unset_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_capture_lines")]
    pub capture_lines: u32,
    #[serde(default = "default_max_event_history")]
    pub max_event_history: usize,
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_capture_lines() -> u32 {
    2000
}
fn default_max_event_history() -> usize {
    5000
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            capture_lines: default_capture_lines(),
            max_event_history: default_max_event_history(),
        }
    }
}

/// Startup-handshake timing. Overridable via flat env vars (§6.4), not the
/// nested `HARNESS__` prefix, to keep the documented variable names literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    #[serde(default = "default_initial_task_delay_ms")]
    pub initial_task_delay_ms: u64,
    #[serde(default = "default_claude_initial_task_delay_ms")]
    pub claude_initial_task_delay_ms: u64,
    #[serde(default = "default_initial_task_ready_timeout_ms")]
    pub initial_task_ready_timeout_ms: u64,
    #[serde(default = "default_tmux_paste_enter_delay_ms")]
    pub tmux_paste_enter_delay_ms: u64,
    #[serde(default = "default_codex_followup_paste_settle_ms")]
    pub codex_followup_paste_settle_ms: u64,
}

fn default_initial_task_delay_ms() -> u64 {
    2000
}
fn default_claude_initial_task_delay_ms() -> u64 {
    7000
}
fn default_initial_task_ready_timeout_ms() -> u64 {
    30_000
}
fn default_tmux_paste_enter_delay_ms() -> u64 {
    150
}
fn default_codex_followup_paste_settle_ms() -> u64 {
    2000
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            initial_task_delay_ms: default_initial_task_delay_ms(),
            claude_initial_task_delay_ms: default_claude_initial_task_delay_ms(),
            initial_task_ready_timeout_ms: default_initial_task_ready_timeout_ms(),
            tmux_paste_enter_delay_ms: default_tmux_paste_enter_delay_ms(),
            codex_followup_paste_settle_ms: default_codex_followup_paste_settle_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyNetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_safety_net_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_stuck_after_ms")]
    pub stuck_after_ms: u64,
    #[serde(default = "default_stuck_warn_interval_ms")]
    pub stuck_warn_interval_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_safety_net_interval_ms() -> u64 {
    30_000
}
fn default_stuck_after_ms() -> u64 {
    180_000
}
fn default_stuck_warn_interval_ms() -> u64 {
    300_000
}

impl Default for SafetyNetConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_safety_net_interval_ms(),
            stuck_after_ms: default_stuck_after_ms(),
            stuck_warn_interval_ms: default_stuck_warn_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), to_file: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestApiConfig {
    #[serde(default = "default_rest_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_rest_port() -> u16 {
    8008
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self { port: default_rest_port(), cors_origins: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for per-agent log/state artifacts (runtime sandboxes, logs,
    /// optional callbacks.json). Relative paths resolve against cwd.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_dir() -> String {
    ".agent-harness".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { log_dir: default_log_dir() }
    }
}

impl Config {
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("agent-harness").join("config.toml"))
    }

    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".agent-harness/config.toml")
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("failed to serialize default config")?;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&defaults_json, config::FileFormat::Json));

        let project_config = Self::project_config_path();
        if project_config.exists() {
            builder = builder.add_source(config::File::from(project_config));
        }

        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("HARNESS")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder.build().context("failed to load configuration")?;
        let mut cfg: Config = built.try_deserialize().context("failed to deserialize configuration")?;
        cfg.apply_flat_env_overrides();
        Ok(cfg)
    }

    /// §6.4 names several tunables as flat env vars rather than nested under
    /// `HARNESS__`; apply those directly as a final override pass.
    fn apply_flat_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HARNESS_INITIAL_TASK_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.startup.initial_task_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("HARNESS_INITIAL_TASK_READY_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.startup.initial_task_ready_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("HARNESS_TMUX_PASTE_ENTER_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.startup.tmux_paste_enter_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("HARNESS_CODEX_FOLLOWUP_PASTE_SETTLE_MS") {
            if let Ok(n) = v.parse() {
                self.startup.codex_followup_paste_settle_ms = n;
            }
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        let path = PathBuf::from(&self.paths.log_dir);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    pub fn logs_path(&self) -> PathBuf {
        self.log_dir().join("logs")
    }

    pub fn callbacks_path(&self) -> PathBuf {
        self.log_dir().join("state").join("callbacks.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmux_prefix: "harness".to_string(),
            poller: PollerConfig::default(),
            startup: StartupConfig::default(),
            safety_net: SafetyNetConfig::default(),
            webhook: WebhookConfig::default(),
            logging: LoggingConfig::default(),
            rest_api: RestApiConfig::default(),
            paths: PathsConfig::default(),
            subscriptions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_tunables() {
        let cfg = Config::default();
        assert_eq!(cfg.tmux_prefix, "harness");
        assert_eq!(cfg.poller.poll_interval_ms, 500);
        assert_eq!(cfg.startup.claude_initial_task_delay_ms, 7000);
        assert_eq!(cfg.safety_net.stuck_after_ms, 180_000);
    }

    #[test]
    fn flat_env_override_wins() {
        std::env::set_var("HARNESS_INITIAL_TASK_DELAY_MS", "9999");
        let mut cfg = Config::default();
        cfg.apply_flat_env_overrides();
        assert_eq!(cfg.startup.initial_task_delay_ms, 9999);
        std::env::remove_var("HARNESS_INITIAL_TASK_DELAY_MS");
    }
}
