//! agent-runner
//!
//! Queues natural-language tasks for one external coding agent, supervises
//! the agent process and streams status to observers over HTTP.

use agent_runner::agent::{CommandAgent, signal_channel};
use agent_runner::cli::{Cli, Command, ListArgs, LogsArgs};
use agent_runner::config::{Config, ConfigLoader, ConfigPaths, ENV_CONFIG_PATH};
use agent_runner::db::Database;
use agent_runner::engine::Engine;
use agent_runner::http;
use agent_runner::logging::{LogTarget, init_tracing};
use agent_runner::types::TaskStatus;
use anyhow::{Result, anyhow};
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let target: LogTarget = cli.log.parse().map_err(|e: String| anyhow!(e))?;
    init_tracing(&target, cli.verbose)?;

    let mut config = load_config(&cli)?;
    cli.apply_overrides(&mut config);
    config.ensure_db_dir()?;

    let db = Arc::new(Database::open(&config.server.db_path)?);
    debug!(path = %config.server.db_path.display(), "Database opened");

    match cli.command {
        None | Some(Command::Serve) => serve(config, db).await,
        Some(Command::List(args)) => list(&db, &args),
        Some(Command::Logs(args)) => logs(&db, &args),
    }
}

/// Tiered config load. `--config` takes the place of the config-path
/// environment variable.
fn load_config(cli: &Cli) -> Result<Config> {
    let explicit = cli.config.clone();
    let loader = ConfigLoader::load_from(ConfigPaths::discover(), |key| {
        if key == ENV_CONFIG_PATH && explicit.is_some() {
            return explicit.clone();
        }
        std::env::var(key).ok()
    })?;
    if let Some(path) = loader.config_path() {
        info!("Using config file {}", path.display());
    }
    Ok(loader.into_config())
}

async fn serve(config: Config, db: Arc<Database>) -> Result<()> {
    let (signal_tx, signal_rx) = signal_channel(config.runner.signal_capacity);
    let agent = Arc::new(CommandAgent::new(config.agent.clone(), signal_tx.clone())?);
    let engine = Engine::new(&config, db, agent, (signal_tx, signal_rx));
    let handle = engine.start().await?;

    let http_handle = if config.server.http.enabled {
        info!("Starting observer API on port {}", config.server.http.port);
        Some(http::start_server_with_retry(
            Arc::clone(&engine),
            &config.server.http,
        ))
    } else {
        info!("Observer API disabled");
        None
    };

    info!("Runner ready");
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    if let Some(http_handle) = http_handle {
        http_handle.shutdown();
    }
    handle.shutdown().await;
    Ok(())
}

fn list(db: &Database, args: &ListArgs) -> Result<()> {
    let statuses = args
        .status
        .iter()
        .map(|s| s.parse::<TaskStatus>())
        .collect::<Result<Vec<_>, String>>()
        .map_err(|e| anyhow!(e))?;
    let tasks = if statuses.is_empty() {
        db.list_tasks_ordered()?
    } else {
        db.list_tasks_by_status(&statuses)?
    };
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}

fn logs(db: &Database, args: &LogsArgs) -> Result<()> {
    for entry in db.get_logs(args.task_id, args.after, args.limit)? {
        if entry.is_error {
            eprintln!("{}", entry.chunk);
        } else {
            println!("{}", entry.chunk);
        }
    }
    Ok(())
}
