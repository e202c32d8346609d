mod cli;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use custsync_core::scheduler::DEFAULT_RETRY_DELAY;
use custsync_core::{
    Config, CustomerSync, MetadataFilter, ReindexTarget, SourceType, Storage, SyncFilters,
    TaskRecord, TaskStatus, VectorStoreKind,
};

use crate::cli::{Cli, Commands};

/// Upper bound on how long one-shot commands wait for queued reindex work.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "custsync=info,custsync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    config.validate()?;

    if let Commands::Wipe { confirm: false } = cli.command {
        bail!("refusing to wipe without --confirm");
    }

    let storage = open_storage(&config).await?;
    let service = CustomerSync::from_config(&config, storage)?;

    let result = dispatch(cli.command, &config, &service).await;
    service.shutdown().await;
    result
}

async fn open_storage(config: &Config) -> Result<Storage> {
    let path = &config.database_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let path = path
        .to_str()
        .with_context(|| format!("database path is not valid UTF-8: {}", path.display()))?;
    tracing::debug!(path, "Opening database");
    Ok(Storage::open(path).await?)
}

async fn dispatch(command: Commands, config: &Config, service: &CustomerSync) -> Result<()> {
    match command {
        Commands::Serve => serve(service).await,
        Commands::Sync {
            source,
            since,
            limit,
            account,
        } => {
            let source: SourceType = source.parse()?;
            let mut filters = SyncFilters::default();
            if let Some(since) = since {
                filters = filters.since(parse_since(&since)?);
            }
            if let Some(limit) = limit {
                filters = filters.with_limit(limit);
            }
            if let Some(account) = account {
                filters = filters.with_account(account);
            }

            let summary = service.sync(source, &filters).await?;
            if !service.wait_idle(DRAIN_TIMEOUT).await {
                tracing::warn!("Reindex queue still busy, exiting anyway");
            }
            print_json(&summary)
        }
        Commands::Reindex {
            customer,
            batch_size,
        } => {
            let target = customer.map_or(ReindexTarget::All { batch_size }, ReindexTarget::Customer);
            let ticket = service.reindex(target).await?;
            let record = finished(service.wait_for_task(ticket.task_id, DRAIN_TIMEOUT).await)?;
            print_json(&record)?;
            if let Some(summary) = &record.summary {
                tracing::info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    batches = summary.batches.len(),
                    "Bulk reindex done"
                );
            }
            ensure_succeeded(&record)
        }
        Commands::Similar {
            id,
            top_k,
            industry,
        } => {
            // A process-local index starts empty.
            if config.vector_store.kind == VectorStoreKind::Memory {
                let ticket = service
                    .reindex(ReindexTarget::All { batch_size: 100 })
                    .await?;
                let record = finished(service.wait_for_task(ticket.task_id, DRAIN_TIMEOUT).await)
                    .context("rebuilding the in-memory index")?;
                ensure_succeeded(&record).context("rebuilding the in-memory index")?;
            }
            let filter = industry.map(|i| MetadataFilter::eq("industry", i.to_lowercase()));
            let similar = service.find_similar(id, top_k, filter).await?;
            print_json(&similar)
        }
        Commands::Failures { limit } => print_json(&service.reindex_failures(limit).await?),
        Commands::Wipe { .. } => {
            let summary = service.wipe_all().await?;
            if !service.wait_idle(DRAIN_TIMEOUT).await {
                tracing::warn!("Deletion events still queued, exiting anyway");
            }
            print_json(&summary)
        }
    }
}

async fn serve(service: &CustomerSync) -> Result<()> {
    let sources = service.sources();
    if sources.is_empty() {
        bail!("no sources enabled");
    }
    tracing::info!(?sources, "Starting custsync");

    let scheduler = service.start_scheduler(DEFAULT_RETRY_DELAY);
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.shutdown().await;
    Ok(())
}

fn finished(record: Option<TaskRecord>) -> Result<TaskRecord> {
    record.context("reindex did not finish in time")
}

fn ensure_succeeded(record: &TaskRecord) -> Result<()> {
    if record.status == TaskStatus::Failed {
        bail!(
            "reindex failed after {} attempts: {}",
            record.attempts,
            record.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid --since value: {raw}"))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
