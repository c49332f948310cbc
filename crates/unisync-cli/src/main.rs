use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use unisync_adapters::{register_all, ServiceRegistry};
use unisync_core::EntityType;
use unisync_storage::{HttpClientConfig, HttpFetcher, PgStore};
use unisync_sync::{SyncConfig, SyncEngine, SyncQueue};
use unisync_web::AppState;
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "unisync")]
#[command(about = "Unified HRIS sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync and exit.
    Sync {
        /// Only this entity type (e.g. `location`, `time-off-balance`).
        #[arg(long)]
        entity: Option<EntityType>,
        /// Only this tenant.
        #[arg(long)]
        tenant: Option<Uuid>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run workers, the cron scheduler (when enabled) and the trigger API until ctrl-c.
    Serve,
    /// List registered (entity type, provider) integrations.
    Providers,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        entity: None,
        tenant: None,
    }) {
        Commands::Sync { entity, tenant } => {
            let engine = engine(config).await?;
            for report in engine.run_once(entity, tenant).await {
                println!(
                    "sync complete: entity={} units={} succeeded={} partial={} failed={} skipped={} persisted={} record_failures={}",
                    report.entity_type,
                    report.units.len(),
                    report.succeeded(),
                    report.partial(),
                    report.failed(),
                    report.skipped(),
                    report.records_persisted(),
                    report.records_failed()
                );
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, 2).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => serve(config).await?,
        Commands::Providers => {
            let settings = config.load_settings()?;
            let http = HttpFetcher::new(HttpClientConfig::default())?;
            let mut builder = ServiceRegistry::builder();
            register_all(&mut builder, Arc::new(http), &settings.provider_settings())
                .context("registering provider integrations")?;
            for (entity_type, provider) in builder.build().registered() {
                println!("{}\t{}\t{}", entity_type.category(), entity_type, provider);
            }
        }
    }

    Ok(())
}

async fn engine(config: SyncConfig) -> Result<SyncEngine> {
    let settings = config.load_settings()?;
    let store = PgStore::connect(&config.database_url, config.max_concurrent_units.max(2) as u32).await?;
    SyncEngine::build(config, &settings, Arc::new(store))
}

async fn serve(config: SyncConfig) -> Result<()> {
    let port = config.web_port;
    let engine = engine(config).await?;
    let (queue, receiver) = SyncQueue::bounded(QUEUE_CAPACITY);
    let workers = engine.spawn_workers(receiver);

    let scheduler = engine.maybe_build_scheduler(queue.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
    }

    unisync_web::serve(port, AppState::new(queue), shutdown_signal()).await?;

    tracing::info!("shutting down");
    engine.request_shutdown();
    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    let processed = workers.join().await;
    tracing::info!(processed, "stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
