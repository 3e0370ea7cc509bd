use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use kickoff_sync::{connect_catalog, prune_ended, run_sync_once_from_env, SyncConfig, SyncPipeline};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kickoff")]
#[command(about = "Keeps the competition and match catalog in step with the fixture feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full pass: discover, prune, fetch and reconcile.
    Sync {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply pending schema migrations.
    Migrate,
    /// Register newly listed competitions only.
    Discover,
    /// Retire competitions past their end date only.
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    info!(?config, "configuration loaded");

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = run_sync_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} active={} ok={} failed={} inserted={} updated={} discovered={} pruned={}",
                    summary.run_id,
                    summary.active_competitions,
                    summary.succeeded,
                    summary.failed,
                    summary.inserted,
                    summary.updated,
                    summary.discovered,
                    summary.pruned
                );
            }
        }
        Commands::Migrate => {
            let store = connect_catalog(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Discover => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let added = pipeline.discover_new().await?;
            println!("discovered {added} new competitions");
        }
        Commands::Prune => {
            let store = connect_catalog(&config).await?;
            let pruned = prune_ended(&store, Utc::now()).await?;
            println!("retired {pruned} competitions");
        }
    }

    Ok(())
}
