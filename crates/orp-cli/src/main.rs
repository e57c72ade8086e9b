use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use orp_recipes::{ChatCompletionsBackend, ModelConfig, Synthesizer};
use orp_storage::OfferStore;
use orp_sync::{maybe_build_scheduler, RefreshOutcome, RefreshPipeline, SyncConfig};
use orp_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "orp-cli")]
#[command(about = "Offer catalog and recipe planner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the API server with the scheduled refresh jobs.
    Serve,
    /// Run one refresh cycle and exit.
    Refresh,
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
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let store = Arc::new(OfferStore::new());
            let pipeline = Arc::new(RefreshPipeline::new(&config, store.clone())?);
            let backend = Arc::new(ChatCompletionsBackend::new(ModelConfig::from_env())?);
            let synthesizer = Arc::new(Synthesizer::new(store.clone(), backend));

            // Populate the catalog before accepting traffic; a failed first
            // cycle is logged but not fatal, the scheduler retries later.
            if let Err(err) = pipeline.refresh_once().await {
                tracing::warn!(error = %err, "initial refresh failed; starting with an empty catalog");
            }

            let _scheduler = maybe_build_scheduler(&config, pipeline.clone()).await?;
            orp_web::serve(AppState::new(store, pipeline, synthesizer)).await?;
        }
        Commands::Refresh => {
            let store = Arc::new(OfferStore::new());
            let pipeline = RefreshPipeline::new(&config, store)?;
            match pipeline.refresh_once().await? {
                RefreshOutcome::Completed(summary) => {
                    info!(
                        run_id = %summary.run_id,
                        sources = summary.sources.len(),
                        upserted = summary.upserted,
                        swept = summary.swept,
                        "refresh complete"
                    );
                    for report in &summary.sources {
                        match &report.error {
                            None => println!(
                                "{}: fetched={} normalized={}",
                                report.source_id, report.fetched, report.normalized
                            ),
                            Some(err) => println!("{}: FAILED ({err})", report.source_id),
                        }
                    }
                }
                RefreshOutcome::Coalesced => println!("refresh already in progress"),
            }
        }
    }

    Ok(())
}
