use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tenderscope_storage::{PgTenderStore, TenderStore};
use tenderscope_sync::{SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tenderscope-cli")]
#[command(about = "Tenderscope command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, dedup and ingest recently updated tenders.
    Sync {
        /// Override the recent window, in days.
        #[arg(long)]
        days: Option<i64>,
    },
    /// Crawl the sources from the top, bounded by a page limit.
    Backfill {
        #[arg(long)]
        max_pages: Option<usize>,
    },
    /// Run the cron scheduler in the foreground until interrupted.
    Scheduler,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tenderscope=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { days: None }) {
        Commands::Sync { days } => {
            if let Some(days) = days {
                config.recent_window_days = days;
            }
            let pipeline = build_pipeline(config).await?;
            let summary = pipeline.run_sync().await?;
            println!(
                "sync complete: run_id={} fetched={} clusters={} duplicates={} created={} updated={} unchanged={} failed={}",
                summary.run_id,
                summary.fetched,
                summary.clusters,
                summary.cross_source_duplicates,
                summary.ingest.created,
                summary.ingest.updated,
                summary.ingest.unchanged,
                summary.ingest.failed,
            );
        }
        Commands::Backfill { max_pages } => {
            let pipeline = build_pipeline(config).await?;
            let summary = pipeline.run_backfill(max_pages).await?;
            println!(
                "backfill complete: run_id={} fetched={} created={} updated={} failed={}",
                summary.run_id,
                summary.fetched,
                summary.ingest.created,
                summary.ingest.updated,
                summary.ingest.failed,
            );
        }
        Commands::Scheduler => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(build_pipeline(config).await?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler requested but could not be built");
            };
            scheduler.start().await?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}

async fn build_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let store: Arc<dyn TenderStore> = Arc::new(PgTenderStore::connect(&config.database_url).await?);
    SyncPipeline::new(config, store)
}
