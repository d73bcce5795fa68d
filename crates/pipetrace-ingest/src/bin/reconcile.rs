//! Reconciliation job for the pipetrace event store.
//!
//! Compares producer audit trails against the event store, classifies gaps
//! against configured outage windows, and replays missing events through the
//! ingest API. Safe to re-run at any time.
//!
//! # Usage
//!
//! ```bash
//! # Reconcile the last 24 hours
//! pipetrace-reconcile --config reconcile.toml \
//!     --ingest-url http://pipetrace:8075
//!
//! # Preview only
//! pipetrace-reconcile --config reconcile.toml --dry-run
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipetrace_emit::{EmitClient, EmitConfig};
use pipetrace_ingest::{EventStore, GapKind, ReconcileConfig, Reconciler};

/// Detect and backfill gaps between producer audit trails and the store.
#[derive(Parser, Debug)]
#[command(name = "pipetrace-reconcile")]
#[command(about = "Reconcile producer audit trails against the pipetrace event store")]
struct Args {
    /// Path to the reconciliation TOML (producers and outage windows)
    #[arg(short, long)]
    config: PathBuf,

    /// ClickHouse URL
    #[arg(long, env = "PIPETRACE_CLICKHOUSE_URL", default_value = "http://localhost:8123")]
    clickhouse_url: String,

    /// ClickHouse database name
    #[arg(long, env = "PIPETRACE_CLICKHOUSE_DB", default_value = "pipetrace")]
    clickhouse_db: String,

    /// Ingest API base URL for replays
    #[arg(long, env = "PIPETRACE_INGEST_URL", default_value = "http://localhost:8075")]
    ingest_url: String,

    /// End of the reconcile window, RFC 3339 (defaults to now)
    #[arg(long)]
    until: Option<DateTime<Utc>>,

    /// Width of the reconcile window in hours, ending at --until
    #[arg(long, default_value = "24")]
    window_hours: u32,

    /// Print the replay plan without emitting anything
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

    let to = args.until.unwrap_or_else(Utc::now);
    let from = to - chrono::Duration::hours(i64::from(args.window_hours));

    let text = fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config = ReconcileConfig::from_toml(&text).context("parsing reconcile config")?;
    info!(
        producers = config.producers.len(),
        outages = config.outages.len(),
        %from,
        %to,
        dry_run = args.dry_run,
        "starting reconciliation"
    );

    let store = EventStore::connect_read_only(&args.clickhouse_url, &args.clickhouse_db);
    let emitter = EmitClient::new(EmitConfig::new(args.ingest_url, "pipetrace-reconcile"))
        .context("building emission client")?;

    let reconciler = Reconciler::new(store, emitter, config);
    let outcomes = reconciler.run(from, to, args.dry_run).await?;

    let mut unexpected = 0usize;
    for outcome in &outcomes {
        let r = &outcome.report;
        match &r.gap {
            None => println!(
                "{}/{}: ok (audit {}, store {})",
                r.service_name, r.stage, r.expected, r.actual
            ),
            Some(GapKind::Expected { annotation }) => println!(
                "{}/{}: gap of {} expected ({})",
                r.service_name,
                r.stage,
                r.expected - r.actual,
                annotation
            ),
            Some(GapKind::Unexpected) => {
                unexpected += 1;
                println!(
                    "{}/{}: UNEXPECTED gap of {} (replayed {})",
                    r.service_name,
                    r.stage,
                    r.expected - r.actual,
                    outcome.replayed
                );
            }
        }
    }

    info!(
        producers = outcomes.len(),
        unexpected, "reconciliation finished"
    );
    Ok(())
}
