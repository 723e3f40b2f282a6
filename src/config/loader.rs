//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Explicit config file that replaces every tier.
pub const ENV_CONFIG_PATH: &str = "AGENT_RUNNER_CONFIG_PATH";

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Embedded defaults (lowest priority)
    Defaults = 0,
    /// Project-level config ($CWD/agent-runner/)
    Project = 1,
    /// User-level config (~/.agent-runner/)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Paths for each configuration tier.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Project-level config directory
    pub project_dir: Option<PathBuf>,
    /// User-level config directory
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        // User dir: AGENT_RUNNER_USER_DIR or ~/.agent-runner
        let user_dir = std::env::var("AGENT_RUNNER_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".agent-runner")));

        // Project dir: AGENT_RUNNER_PROJECT_DIR or $CWD/agent-runner
        let project_dir = std::env::var("AGENT_RUNNER_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("agent-runner")));

        Self {
            project_dir,
            user_dir,
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }

    /// Config file for a tier, if that tier has a directory.
    pub fn config_file(&self, tier: ConfigTier) -> Option<PathBuf> {
        let dir = match tier {
            ConfigTier::Project => self.project_dir.as_ref(),
            ConfigTier::User => self.user_dir.as_ref(),
            ConfigTier::Defaults | ConfigTier::Environment => None,
        }?;
        Some(dir.join("config.yaml"))
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Paths for each tier
    pub paths: ConfigPaths,
    /// Loaded configuration
    config: Config,
    /// Highest-priority config file that contributed (if any)
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        Self::load_from(paths, |key| std::env::var(key).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn load_from(paths: ConfigPaths, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Check for explicit config path override
        if let Some(explicit_path) = env(ENV_CONFIG_PATH) {
            let path = PathBuf::from(&explicit_path);
            let mut config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            Self::apply_env_overrides(&mut config, &env);
            return Ok(Self {
                paths,
                config,
                config_path: Some(path),
            });
        }

        // Collect configs from each tier
        let mut configs: Vec<Value> = vec![serde_json::to_value(Config::default())?];
        let mut config_path = None;

        for tier in [ConfigTier::Project, ConfigTier::User] {
            let Some(config_file) = paths.config_file(tier) else {
                continue;
            };
            if let Some(value) = read_yaml(&config_file) {
                debug!(%tier, path = %config_file.display(), "Loaded config tier");
                configs.push(value);
                config_path = Some(config_file);
            }
        }

        // Merge all configs
        let merged = deep_merge_all(configs);
        let mut config: Config = serde_json::from_value(merged)?;

        // Tier 4: Environment variable overrides
        Self::apply_env_overrides(&mut config, &env);

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    /// Apply environment variable overrides to config.
    fn apply_env_overrides(config: &mut Config, env: &impl Fn(&str) -> Option<String>) {
        if let Some(db_path) = env("AGENT_RUNNER_DB_PATH") {
            config.server.db_path = PathBuf::from(db_path);
        }

        if let Some(port) = env("AGENT_RUNNER_PORT") {
            match port.parse() {
                Ok(port) => config.server.http.port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid AGENT_RUNNER_PORT"),
            }
        }

        if let Some(max_retries) = env("AGENT_RUNNER_MAX_RETRIES") {
            match max_retries.parse() {
                Ok(n) => config.recovery.max_retries = n,
                Err(_) => warn!(value = %max_retries, "Ignoring invalid AGENT_RUNNER_MAX_RETRIES"),
            }
        }

        if let Some(program) = env("AGENT_RUNNER_AGENT_PROGRAM") {
            config.agent.program = program;
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable configuration (for CLI overrides).
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Config file that was used, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Parse a YAML tier file. Unreadable or malformed files are skipped with a warning.
fn read_yaml(path: &Path) -> Option<Value> {
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read config file");
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffStrategy;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_config_paths_discover() {
        let paths = ConfigPaths::discover();
        assert!(paths.project_dir.is_some());
        // user_dir may or may not exist depending on environment
    }

    #[test]
    fn test_load_defaults_only() {
        // Create empty temp dirs so no config files are found
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_dirs(
            Some(temp.path().join("project")),
            Some(temp.path().join("user")),
        );

        let loader = ConfigLoader::load_from(paths, no_env).unwrap();
        let config = loader.config();

        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.runner.kill_timeout_ms, 5_000);
        assert!(loader.config_path().is_none());
    }

    #[test]
    fn test_project_config_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("agent-runner");
        std::fs::create_dir_all(&project_dir).unwrap();

        let config_content = r#"
recovery:
  max_retries: 5
"#;
        std::fs::write(project_dir.join("config.yaml"), config_content).unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir), Some(temp.path().join("user")));

        let loader = ConfigLoader::load_from(paths, no_env).unwrap();
        let config = loader.config();

        assert_eq!(config.recovery.max_retries, 5);
        assert_eq!(config.recovery.restart_after_retries, 2);
    }

    #[test]
    fn test_user_config_overrides_project() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("agent-runner");
        let user_dir = temp.path().join("user");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::create_dir_all(&user_dir).unwrap();

        let project_config = r#"
recovery:
  max_retries: 5
  backoff:
    strategy: exponential
"#;
        std::fs::write(project_dir.join("config.yaml"), project_config).unwrap();

        let user_config = r#"
recovery:
  max_retries: 1
"#;
        std::fs::write(user_dir.join("config.yaml"), user_config).unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir), Some(user_dir.clone()));

        let loader = ConfigLoader::load_from(paths, no_env).unwrap();
        let config = loader.config();

        assert_eq!(config.recovery.max_retries, 1);
        assert_eq!(config.recovery.backoff.strategy, BackoffStrategy::Exponential);
        assert_eq!(loader.config_path(), Some(user_dir.join("config.yaml").as_path()));
    }

    #[test]
    fn test_env_overrides_files() {
        let temp = TempDir::new().unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("AGENT_RUNNER_DB_PATH", "/tmp/runner.db"),
            ("AGENT_RUNNER_PORT", "4000"),
            ("AGENT_RUNNER_MAX_RETRIES", "not-a-number"),
            ("AGENT_RUNNER_AGENT_PROGRAM", "my-agent"),
        ]);
        let paths = ConfigPaths::with_dirs(Some(temp.path().join("p")), None);

        let loader =
            ConfigLoader::load_from(paths, |k| env.get(k).map(|v| v.to_string())).unwrap();
        let config = loader.config();

        assert_eq!(config.server.db_path, PathBuf::from("/tmp/runner.db"));
        assert_eq!(config.server.http.port, 4000);
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.agent.program, "my-agent");
    }

    #[test]
    fn test_explicit_path_replaces_tiers() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("agent-runner");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("config.yaml"), "recovery:\n  max_retries: 9\n").unwrap();
        let explicit = temp.path().join("explicit.yaml");
        std::fs::write(&explicit, "runner:\n  cancel_timeout_ms: 250\n").unwrap();
        let explicit_str = explicit.to_string_lossy().to_string();

        let paths = ConfigPaths::with_dirs(Some(project_dir), None);
        let loader = ConfigLoader::load_from(paths, |k| {
            (k == ENV_CONFIG_PATH).then(|| explicit_str.clone())
        })
        .unwrap();

        assert_eq!(loader.config().runner.cancel_timeout_ms, 250);
        assert_eq!(loader.config().recovery.max_retries, 3);
        assert_eq!(loader.config_path(), Some(explicit.as_path()));
    }

    #[test]
    fn test_malformed_tier_is_skipped() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("agent-runner");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("config.yaml"), "recovery: [unclosed").unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir), None);
        let loader = ConfigLoader::load_from(paths, no_env).unwrap();
        assert_eq!(loader.config().recovery.max_retries, 3);
    }
}
