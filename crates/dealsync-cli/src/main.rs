use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealsync_storage::PgStore;
use dealsync_sync::{connect_pipeline, ServiceConfig};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dealsync")]
#[command(about = "CRM deal webhook sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server, plus the cron sweep when enabled.
    Serve,
    /// Run one retry sweep and print its summary.
    Sweep,
    /// Run one processing pass over a stored event.
    Process { event_id: Uuid },
    /// Upsert every eligible CRM deal as a lead.
    Import {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,dealsync=debug"))
        .context("invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let (_store, pipeline) = connect_pipeline(&config).await?;
            let scheduler = pipeline
                .scheduler
                .maybe_build_scheduler(config.scheduler_enabled, &config.sweep_cron)
                .await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting sweep scheduler")?;
                info!(cron = %config.sweep_cron, "retry sweep scheduled");
            }
            dealsync_web::serve(Arc::new(pipeline), config.web_port).await?;
        }
        Commands::Sweep => {
            let (_store, pipeline) = connect_pipeline(&config).await?;
            let summary = pipeline.scheduler.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Process { event_id } => {
            let (_store, pipeline) = connect_pipeline(&config).await?;
            let outcome = pipeline.processor.process(event_id).await;
            if outcome.needs_retry_bookkeeping() {
                pipeline.scheduler.schedule_after_failure(&outcome).await?;
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Import { limit } => {
            let (_store, pipeline) = connect_pipeline(&config).await?;
            let summary = pipeline.importer.run(limit).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, 2).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
