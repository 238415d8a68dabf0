use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dailydeals_ingest::{ingest_file, DealsConfig, IngestPipeline};
use dailydeals_storage::{DealStore, GraphMediaFetcher, InMemoryDealStore, PgDealStore};
use dailydeals_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dailydeals")]
#[command(about = "WhatsApp group deals: webhook ingestion and gallery")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Create the whatsapp.deals schema and table
    Migrate,
    /// Replay a saved webhook body through the pipeline
    Ingest {
        path: PathBuf,
        /// Keep deals in memory instead of writing to DATABASE_URL
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dailydeals=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = DealsConfig::from_env();
    config.log_summary();

    let pg = Arc::new(
        PgDealStore::connect_lazy(config.database_url.as_deref())
            .context("configuring postgres pool")?,
    );
    let media = Arc::new(
        GraphMediaFetcher::new(config.media_client_config()).context("building media client")?,
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if let Err(err) = pg.ensure_schema().await {
                warn!(error = %err, "schema bootstrap failed; continuing");
            }
            let state = AppState::new(&config, pg, media);
            dailydeals_web::serve(state, &config.host, config.port).await?;
        }
        Commands::Migrate => {
            pg.ensure_schema()
                .await
                .context("creating whatsapp.deals")?;
            info!("schema ready");
        }
        Commands::Ingest { path, dry_run } => {
            let store: Arc<dyn DealStore> = if dry_run {
                Arc::new(InMemoryDealStore::new())
            } else {
                pg
            };
            let pipeline = IngestPipeline::new(store, media);
            let summary = ingest_file(&pipeline, &path).await?;
            println!(
                "ingest complete: delivery_id={} messages={} links={} inserted={} duplicates={} media_failures={} store_failures={}",
                summary.delivery_id,
                summary.messages,
                summary.links,
                summary.inserted,
                summary.duplicates,
                summary.media_failures,
                summary.store_failures
            );
        }
    }

    Ok(())
}
