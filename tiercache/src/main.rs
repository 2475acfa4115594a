mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use tiercache_core::{logging, CacheManager, Config, PlexMediaServer};
use tiercache_providers::plex::PlexClient;
use tiercache_providers::trakt::TraktClient;

#[derive(Parser)]
#[command(name = "tiercache", about = "Media cache tier coordinator", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single cache cycle and exit.
    Run,
    /// Run the scheduler and session monitor until interrupted.
    Daemon,
    /// Reconcile tracker state against the filesystem and exit.
    Reconcile,
    /// Print cache statistics as JSON and exit.
    Stats,
}

fn build_manager(config: Config) -> Result<CacheManager> {
    let client = PlexClient::new(&config.upstream.url, &config.upstream.token)
        .context("Invalid Plex connection settings")?;
    let mut upstream =
        PlexMediaServer::new(client, config.upstream.library_sections.clone());
    if config.trakt.enabled {
        upstream = upstream.with_trakt(TraktClient::new(&config.trakt.client_id));
    }
    CacheManager::new(config, Arc::new(upstream)).context("Failed to initialize cache manager")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    let scheduler_config = config.scheduler.clone();
    let manager = Arc::new(build_manager(config)?);

    match cli.command {
        Command::Run => {
            manager.start().await?;
            let summary = manager.run_cycle().await?;
            manager.stop().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Daemon => {
            let reconciliation = manager.start().await?;
            info!(
                orphaned = reconciliation.orphaned_found,
                stale = reconciliation.stale_removed,
                "Startup reconciliation done"
            );
            scheduler::run(manager.clone(), &scheduler_config).await;
            manager.stop().await;
        }
        Command::Reconcile => {
            manager.start().await?;
            let result = manager.reconcile().await?;
            manager.stop().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Stats => {
            manager.start().await?;
            let stats = manager.stats().await;
            manager.stop().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
