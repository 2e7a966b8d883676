use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use courier_core::app::{OutboxOptions, PartitionManager, WorkerType};
use courier_core::impls::{DbMapping, PgPartitionStore};
use courier_core::ports::SystemClock;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Debug, Parser)]
#[command(name = "courier", about = "Transactional outbox processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler against an in-memory outbox.
    Demo {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        #[arg(long)]
        worker_type: Option<WorkerType>,
        #[arg(long, default_value_t = 20)]
        items: u64,
        /// Every n-th item fails once (0 = never).
        #[arg(long, default_value_t = 4)]
        fail_every: u64,
        /// Worker delay in milliseconds, unless set by `--config`.
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
        /// OutboxOptions as JSON.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Create upcoming and drop expired partitions once.
    Partitions {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        schema: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_options(
    path: Option<&PathBuf>,
) -> Result<Option<OutboxOptions>, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            Ok(Some(OutboxOptions::from_json(&json)?))
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    match Cli::parse().command {
        Command::Demo {
            seconds,
            worker_type,
            items,
            fail_every,
            delay_ms,
            config,
        } => {
            let mut options = match load_options(config.as_ref())? {
                Some(options) => options,
                None => OutboxOptions {
                    worker_delay: Duration::from_millis(delay_ms),
                    outbox_items_limit: 5,
                    ..OutboxOptions::default()
                },
            };
            if let Some(worker_type) = worker_type {
                options.worker_type = worker_type;
            }
            demo::run(demo::DemoArgs {
                options,
                items,
                fail_every,
                run_for: Duration::from_secs(seconds),
            })
            .await
        }
        Command::Partitions {
            database_url,
            table,
            schema,
            config,
        } => {
            let mut settings = load_options(config.as_ref())?
                .unwrap_or_default()
                .partitions;
            settings.enabled = true;

            let mut mapping = DbMapping::new(&table);
            mapping.schema = schema;
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&database_url)
                .await?;
            let store = Arc::new(PgPartitionStore::new(pool, mapping));
            let manager = PartitionManager::new(table, store, Arc::new(SystemClock));

            let created = manager.create_upcoming_partitions(&settings).await?;
            let dropped = manager.retire_old_partitions(&settings).await?;
            info!(outbox = %manager.outbox(), created, dropped, "partition maintenance done");
            Ok(())
        }
    }
}
