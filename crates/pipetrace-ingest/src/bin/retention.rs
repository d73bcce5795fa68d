//! Retention sweep for the pipetrace event store.
//!
//! Drops whole monthly partitions of `pipeline_events` older than the
//! retention horizon. Runs from cron or a systemd timer.
//!
//! # Usage
//!
//! ```bash
//! # Drop partitions fully outside a 180-day horizon
//! pipetrace-retention --retention-days 180
//!
//! # Preview only
//! pipetrace-retention --retention-days 180 --dry-run
//! ```

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use clickhouse::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipetrace_ingest::PartitionManager;

/// Drop event partitions past the retention horizon.
#[derive(Parser, Debug)]
#[command(name = "pipetrace-retention")]
#[command(about = "Drop pipetrace event partitions older than the retention horizon")]
struct Args {
    /// ClickHouse URL
    #[arg(long, env = "PIPETRACE_CLICKHOUSE_URL", default_value = "http://localhost:8123")]
    clickhouse_url: String,

    /// ClickHouse database name
    #[arg(long, env = "PIPETRACE_CLICKHOUSE_DB", default_value = "pipetrace")]
    clickhouse_db: String,

    /// Retention horizon in days
    #[arg(long, env = "PIPETRACE_RETENTION_DAYS", default_value = "180")]
    retention_days: u32,

    /// List what would be dropped without dropping it
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let client = Client::default()
        .with_url(&args.clickhouse_url)
        .with_database(&args.clickhouse_db);
    let manager = PartitionManager::new(client);

    let partitions = manager.list_partitions().await?;
    info!(partitions = partitions.len(), "partition inventory");
    for part in &partitions {
        println!(
            "{}: {} rows, {} bytes",
            part.partition_id, part.rows, part.bytes_on_disk
        );
    }

    let dropped = manager
        .enforce_retention(Utc::now(), args.retention_days, args.dry_run)
        .await?;

    if args.dry_run {
        println!("dry run: {} partition(s) would be dropped", dropped.len());
    } else {
        println!("dropped {} partition(s)", dropped.len());
    }
    Ok(())
}
