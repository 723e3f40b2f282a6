//! CLI command definitions for agent-runner
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use crate::config::Config;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Queue and supervise tasks for a single coding agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (replaces the project and user tiers)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Port for the observer API (overrides config)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Do not start the observer API
    #[arg(long, global = true)]
    pub no_http: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(database) = &self.database {
            config.server.db_path = PathBuf::from(database);
        }
        if let Some(port) = self.port {
            config.server.http.port = port;
        }
        if self.no_http {
            config.server.http.enabled = false;
        }
    }
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine (default if no subcommand given)
    Serve,

    /// Print tasks from the database as JSON
    List(ListArgs),

    /// Print a task's execution log
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only these statuses (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub status: Vec<String>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Task id
    pub task_id: i64,

    /// Only chunks after this log id
    #[arg(long)]
    pub after: Option<i64>,

    /// Maximum number of chunks
    #[arg(long)]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve_on_stderr() {
        let cli = Cli::parse_from(["agent-runner"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "2");
        assert!(!cli.no_http);
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let cli = Cli::parse_from([
            "agent-runner",
            "--database",
            "/tmp/runner.db",
            "--port",
            "4000",
            "--no-http",
            "serve",
        ]);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/runner.db"));
        assert_eq!(config.server.http.port, 4000);
        assert!(!config.server.http.enabled);
        assert!(matches!(cli.command, Some(Command::Serve)));
    }

    #[test]
    fn test_list_accepts_status_list() {
        let cli = Cli::parse_from(["agent-runner", "list", "--status", "queued,running"]);
        let Some(Command::List(args)) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.status, vec!["queued", "running"]);
    }
}
