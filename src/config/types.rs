//! Configuration types and structures.

use crate::events::BackpressurePolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port for the HTTP observer surface.
pub const DEFAULT_HTTP_PORT: u16 = 31995;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            http: HttpConfig::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("agent-runner/tasks.db")
}

/// HTTP observer surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Initial retry delay in milliseconds when the listener fails to bind (default: 15000).
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Maximum retry interval in milliseconds (default: 240000 = 4 minutes).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Exponential backoff multiplier (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub retry_multiplier: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_http_port(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_multiplier: default_multiplier(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_retry_initial_ms() -> u64 {
    15_000
}

fn default_retry_max_ms() -> u64 {
    240_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Runner supervisor timeouts and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// How long to wait for the agent to acknowledge a cancel (default: 10000).
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,

    /// How long a forced stop may take before it is reported as failed (default: 5000).
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Turn an unacknowledged cancel into a kill instead of reporting a timeout.
    #[serde(default = "default_true")]
    pub escalate_cancel_to_kill: bool,

    /// Scheduler safety-net poll interval (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the agent signal channel.
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: default_cancel_timeout_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            escalate_cancel_to_kill: true,
            poll_interval_ms: default_poll_interval_ms(),
            signal_capacity: default_signal_capacity(),
        }
    }
}

impl RunnerConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_cancel_timeout_ms() -> u64 {
    10_000
}

fn default_kill_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_signal_capacity() -> usize {
    256
}

/// How long to wait out a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always wait `fixed_delay_ms`.
    #[default]
    Fixed,
    /// `initial_delay_ms * multiplier^(hits - 1)`, capped at `max_delay_ms`.
    Exponential,
    /// Use the agent's retry-after hint, falling back to `fixed_delay_ms`.
    AgentProvided,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,

    #[serde(default = "default_fixed_delay_ms")]
    pub fixed_delay_ms: u64,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            fixed_delay_ms: default_fixed_delay_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_fixed_delay_ms() -> u64 {
    60_000
}

fn default_initial_delay_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    900_000
}

/// Recovery policy bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Retries (RETRY or RESTART_SESSION) allowed before a task is failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive RETRY attempts after which the session is restarted
    /// instead. 0 never restarts.
    #[serde(default = "default_restart_after_retries")]
    pub restart_after_retries: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            restart_after_retries: default_restart_after_retries(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_restart_after_retries() -> u32 {
    2
}

/// Observer fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Pending events held per observer.
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,

    #[serde(default)]
    pub backpressure: BackpressurePolicy,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            observer_capacity: default_observer_capacity(),
            backpressure: BackpressurePolicy::default(),
        }
    }
}

fn default_observer_capacity() -> usize {
    1_024
}

/// External agent command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,

    /// Arguments for a fresh session. The instruction is appended last.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,

    /// Arguments for a reused session. The instruction is appended last.
    #[serde(default = "default_resume_args")]
    pub resume_args: Vec<String>,

    /// Added when a task asks to skip permission prompts.
    #[serde(default = "default_skip_permissions_flag")]
    pub skip_permissions_flag: String,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Output lines matching this pattern are treated as a rate-limit notice.
    #[serde(default = "default_rate_limit_pattern")]
    pub rate_limit_pattern: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: default_agent_args(),
            resume_args: default_resume_args(),
            skip_permissions_flag: default_skip_permissions_flag(),
            working_dir: None,
            rate_limit_pattern: default_rate_limit_pattern(),
        }
    }
}

fn default_agent_program() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_resume_args() -> Vec<String> {
    vec!["--print".to_string(), "--continue".to_string()]
}

fn default_skip_permissions_flag() -> String {
    "--dangerously-skip-permissions".to_string()
}

fn default_rate_limit_pattern() -> String {
    r"(?i)(rate[ _-]?limit|usage limit|too many requests)".to_string()
}

impl Config {
    /// Load configuration from a file, falling back to defaults if missing.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_yaml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
