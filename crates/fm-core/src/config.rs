use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.foreman/config.toml`.
///
/// Credentials (policy backend tokens, provider API keys) are never stored
/// here; they are read from environment variables by the components that
/// need them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub approvals: ApprovalsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl Config {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.concurrency == 0 {
            return Err(ConfigError::Validation(
                "queue.concurrency must be at least 1".into(),
            ));
        }
        if self.queue.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "queue.poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.approvals.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "approvals.sweep_interval_secs must be at least 1".into(),
            ));
        }
        if self.queue.retry_base_delay_secs == 0 {
            return Err(ConfigError::Validation(
                "queue.retry_base_delay_secs must be at least 1".into(),
            ));
        }
        if self.queue.retry_max_delay_secs < self.queue.retry_base_delay_secs {
            return Err(ConfigError::Validation(
                "queue.retry_max_delay_secs must not be below the base delay".into(),
            ));
        }
        if self.runner.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "runner.max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("config.toml")
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
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_service_name() -> String {
    "foreman".into()
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
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".foreman")
        .join("foreman.db")
        .to_string_lossy()
        .into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between poll passes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum tasks claimed (and processed) per pass.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// A `processing` task older than this is considered abandoned.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            concurrency: default_concurrency(),
            stale_timeout_secs: default_stale_timeout(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            default_max_attempts: default_max_attempts(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}
fn default_concurrency() -> u32 {
    4
}
fn default_stale_timeout() -> u64 {
    600
}
fn default_retry_base_delay() -> u64 {
    10
}
fn default_retry_max_delay() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Hard per-tool-call timeout.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// How many long-term memories are recalled per run.
    #[serde(default = "default_recall_k")]
    pub recall_k: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            tool_timeout_secs: default_tool_timeout(),
            recall_k: default_recall_k(),
        }
    }
}

fn default_max_iterations() -> u32 {
    10
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_recall_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    /// Default lifetime of a pending approval request.
    #[serde(default = "default_approval_ttl")]
    pub default_ttl_secs: u64,
    /// Seconds between expiry sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_approval_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_approval_ttl() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// URL of the external policy backend; unset disables the check.
    #[serde(default)]
    pub backend_url: Option<String>,
    /// URL of the relationship authorizer; unset disables the check.
    #[serde(default)]
    pub relationship_url: Option<String>,
    /// When true, a backend error or timeout allows the call instead of
    /// denying it.
    #[serde(default)]
    pub fail_open: bool,
    #[serde(default = "default_policy_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            relationship_url: None,
            fail_open: false,
            timeout_ms: default_policy_timeout_ms(),
        }
    }
}

fn default_policy_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowConfig {
    /// Base URL of the external durable-workflow engine; unset keeps all
    /// dispatch on the local queue.
    #[serde(default)]
    pub dispatcher_url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
