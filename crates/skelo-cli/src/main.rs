mod config;
mod serve_cmd;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use skelo_core::dispatcher::Dispatcher;
use skelo_core::watchdog::Watchdog;
use skelo_core::webhook::WebhookNotifier;
use skelo_db::pool;

use config::{ConfigFile, ServerSection, SkeloConfig};
use serve_cmd::AppState;

#[derive(Parser)]
#[command(name = "skelo", about = "Single-node orchestrator for AI coding and research tasks")]
struct Cli {
    /// Database file path (overrides SKELO_DB_PATH env var)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a skelo config file with a generated API key
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the database file and schema
    DbInit,
    /// Run the orchestrator: dispatcher, watchdog, and HTTP control plane
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show task counts by status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => cmd_init(force),
        Commands::DbInit => cmd_db_init(cli.db_path.as_deref()).await,
        Commands::Serve { host, port } => cmd_serve(cli.db_path.as_deref(), host, port).await,
        Commands::Status => cmd_status(cli.db_path.as_deref()).await,
    }
}

fn cmd_init(force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        server: ServerSection {
            api_key: Some(config::generate_api_key()),
            ..Default::default()
        },
        ..Default::default()
    };
    config::save_config(&file)?;
    println!("wrote config to {}", path.display());
    println!("add adapters under [[adapters]] before running `skelo serve`");
    Ok(())
}

async fn cmd_db_init(cli_db_path: Option<&str>) -> Result<()> {
    let config = SkeloConfig::resolve(cli_db_path)?;
    let pool = pool::create_pool(&config.db_config).await?;
    let counts = pool::table_counts(&pool).await?;
    println!("database ready at {}", config.db_config.db_path.display());
    for (table, count) in counts {
        println!("  {table}: {count} rows");
    }
    Ok(())
}

async fn cmd_status(cli_db_path: Option<&str>) -> Result<()> {
    let config = SkeloConfig::resolve(cli_db_path)?;
    let pool = pool::create_pool(&config.db_config).await?;
    let rows = skelo_db::queries::tasks::status_counts(&pool).await?;
    if rows.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    for (status, count) in rows {
        println!("{status}: {count}");
    }
    Ok(())
}

async fn cmd_serve(
    cli_db_path: Option<&str>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let config = SkeloConfig::resolve(cli_db_path)?;
    if config.adapters.is_empty() {
        tracing::warn!("no adapters configured; tasks can only be claimed via the HTTP API");
    }

    let pool = pool::create_pool(&config.db_config).await?;

    let notifier = if config.webhooks.is_empty() {
        None
    } else {
        Some(WebhookNotifier::new(config.webhooks.clone()))
    };

    let cancel = CancellationToken::new();

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        config.dispatcher.clone(),
        config.adapters.clone(),
        notifier.clone(),
        None,
    ));
    let watchdog = Arc::new(Watchdog::new(
        pool.clone(),
        config.watchdog.clone(),
        notifier.clone(),
        None,
    ));

    let dispatcher_task = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };
    let watchdog_task = {
        let watchdog = Arc::clone(&watchdog);
        let cancel = cancel.clone();
        tokio::spawn(async move { watchdog.run(cancel).await })
    };

    let state = AppState {
        pool,
        api_key: config.server.api_key.clone(),
        notifier,
        lease_ttl: config.dispatcher.lease_ttl,
    };

    let bind_host = host.unwrap_or_else(|| config.server.host.clone());
    let bind_port = port.unwrap_or(config.server.port);

    let shutdown_cancel = cancel.clone();
    let shutdown = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        shutdown_cancel.cancel();
    };

    serve_cmd::run_serve(state, &bind_host, bind_port, shutdown).await?;

    // The signal handler cancelled the token; give the schedulers a
    // moment to drain before exiting.
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = dispatcher_task.await;
        let _ = watchdog_task.await;
    })
    .await;

    Ok(())
}
