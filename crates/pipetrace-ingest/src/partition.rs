//! Partition inventory and retention sweeps.
//!
//! `pipeline_events` is partitioned by month of `occurred_at`, so retention
//! is a handful of `ALTER TABLE ... DROP PARTITION` statements instead of a
//! row-level delete. ClickHouse materializes new partitions on first insert;
//! nothing has to pre-create them.

use chrono::{DateTime, Datelike, Utc};
use clickhouse::{Client, Row};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::Result;

const EVENTS_TABLE: &str = "pipeline_events";

/// One active partition of the events table.
#[derive(Debug, Clone, Row, Deserialize)]
pub struct PartitionInfo {
    /// Partition id; `YYYYMM` digits for a `toYYYYMM` partition key.
    pub partition_id: String,
    pub rows: u64,
    pub bytes_on_disk: u64,
}

/// Manages partitions of the events table.
#[derive(Clone)]
pub struct PartitionManager {
    client: Client,
}

impl PartitionManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// List active partitions from `system.parts`, oldest first.
    pub async fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let rows = self
            .client
            .query(
                "SELECT
                    partition_id,
                    sum(rows) AS rows,
                    sum(bytes_on_disk) AS bytes_on_disk
                FROM system.parts
                WHERE database = currentDatabase() AND table = ? AND active
                GROUP BY partition_id
                ORDER BY partition_id ASC",
            )
            .bind(EVENTS_TABLE)
            .fetch_all()
            .await?;
        Ok(rows)
    }

    /// Drop every partition strictly older than the retention horizon.
    ///
    /// Returns the ids of the partitions dropped. The partition holding the
    /// cutoff month is kept; retention is whole months only.
    pub async fn enforce_retention(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
        dry_run: bool,
    ) -> Result<Vec<String>> {
        let cutoff = cutoff_month(now, retention_days);
        let mut dropped = Vec::new();

        for part in self.list_partitions().await? {
            if !partition_expired(&part.partition_id, cutoff) {
                continue;
            }
            if dry_run {
                info!(
                    partition = %part.partition_id,
                    rows = part.rows,
                    "would drop partition (dry run)"
                );
            } else {
                info!(partition = %part.partition_id, rows = part.rows, "dropping partition");
                self.client
                    .query(&drop_partition_statement(&part.partition_id))
                    .execute()
                    .await?;
                metrics::counter!("retention_partitions_dropped_total").increment(1);
            }
            dropped.push(part.partition_id);
        }

        if dropped.is_empty() {
            info!(cutoff, "no partitions past the retention horizon");
        }
        Ok(dropped)
    }
}

/// Drop by partition id, which `system.parts` hands us verbatim; dropping
/// by value would route the quoted string through an implicit cast to the
/// partition key type.
fn drop_partition_statement(partition_id: &str) -> String {
    format!(
        "ALTER TABLE {} DROP PARTITION ID '{}'",
        EVENTS_TABLE, partition_id
    )
}

/// The `YYYYMM` month containing `now - retention_days`.
fn cutoff_month(now: DateTime<Utc>, retention_days: u32) -> u32 {
    let horizon = now - chrono::Duration::days(i64::from(retention_days));
    horizon.year() as u32 * 100 + horizon.month()
}

/// Whether a partition id is strictly older than the cutoff month.
///
/// Malformed ids are kept and logged rather than dropped.
fn partition_expired(partition: &str, cutoff: u32) -> bool {
    match partition.parse::<u32>() {
        Ok(month) => month < cutoff,
        Err(_) => {
            warn!(partition, "unparseable partition id, keeping");
            false
        }
    }
}
