//! Unified configuration system.
//!
//! Consolidates configuration from tiers with field-by-field YAML merging:
//! 1. **Defaults** - `Config::default()`
//! 2. **Project** - `$CWD/agent-runner/config.yaml`
//! 3. **User** - `~/.agent-runner/config.yaml`
//! 4. **Environment** - individual overrides
//!
//! ## Environment Variables
//! - `AGENT_RUNNER_CONFIG_PATH` - Explicit config file (overrides all tiers)
//! - `AGENT_RUNNER_DB_PATH` - Database path
//! - `AGENT_RUNNER_PORT` - HTTP port
//! - `AGENT_RUNNER_MAX_RETRIES` - Recovery retry budget
//! - `AGENT_RUNNER_AGENT_PROGRAM` - Agent executable
//! - `AGENT_RUNNER_USER_DIR` - User config dir (default: `~/.agent-runner`)
//! - `AGENT_RUNNER_PROJECT_DIR` - Project config dir (default: `./agent-runner`)

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier, ENV_CONFIG_PATH};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
