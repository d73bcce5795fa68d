//! Read-only access to producer audit databases.
//!
//! Every producer keeps its own local SQLite audit trail of the work it
//! performed (`audit_events(article_url, source_name, occurred_at)`).
//! Reconciliation reads these as the source of truth for "what should have
//! been reported". Databases are opened immutable so WAL-mode files can be
//! read from a snapshot or a live producer without write access to the
//! `-wal`/`-shm` companions.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use tracing::info;

use crate::error::Result;

/// One audit-trail row: a unit of work the producer claims to have done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub article_url: String,
    pub source_name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Read-only reader over a producer's audit database.
pub struct AuditReader {
    conn: Connection,
}

impl AuditReader {
    /// Open an audit database read-only and immutable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        // SQLite URI form so the immutable flag applies; file:// plus an
        // absolute path yields file:///...
        let uri = format!(
            "file://{}?immutable=1",
            path.to_string_lossy().replace('?', "%3F")
        );
        let conn = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        info!("Audit database opened (immutable): {}", path.display());
        Ok(Self { conn })
    }

    /// Count of distinct article URLs recorded in the window.
    pub fn distinct_article_count(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT article_url) FROM audit_events
             WHERE occurred_at >= ?1 AND occurred_at < ?2",
            (from.timestamp(), to.timestamp()),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// All rows in the window, one per distinct URL (earliest occurrence).
    pub fn rows_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT article_url, source_name, MIN(occurred_at) FROM audit_events
             WHERE occurred_at >= ?1 AND occurred_at < ?2
             GROUP BY article_url
             ORDER BY 3 ASC",
        )?;

        let rows = stmt.query_map((from.timestamp(), to.timestamp()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (article_url, source_name, ts) = row?;
            let occurred_at = DateTime::from_timestamp(ts, 0).unwrap_or_default();
            out.push(AuditRow {
                article_url,
                source_name,
                occurred_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn seed_audit_db(path: &Path, rows: &[(&str, &str, &str)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "CREATE TABLE audit_events (
                article_url TEXT NOT NULL,
                source_name TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            )",
            (),
        )
        .unwrap();
        for (url, source, at) in rows {
            conn.execute(
                "INSERT INTO audit_events (article_url, source_name, occurred_at)
                 VALUES (?1, ?2, ?3)",
                (url, source, utc(at).timestamp()),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_counts_and_rows_in_window() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("crawler.db");
        seed_audit_db(
            &db,
            &[
                ("https://x.test/a", "wire", "2026-02-10T09:00:00Z"),
                ("https://x.test/a", "wire", "2026-02-10T09:30:00Z"), // retry, same URL
                ("https://x.test/b", "wire", "2026-02-10T10:00:00Z"),
                ("https://x.test/c", "wire", "2026-02-11T10:00:00Z"), // outside window
            ],
        );

        let reader = AuditReader::open(&db).unwrap();
        let from = utc("2026-02-10T00:00:00Z");
        let to = utc("2026-02-11T00:00:00Z");

        assert_eq!(reader.distinct_article_count(from, to).unwrap(), 2);

        let rows = reader.rows_in_window(from, to).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].article_url, "https://x.test/a");
        // Earliest occurrence wins for a retried URL.
        assert_eq!(rows[0].occurred_at, utc("2026-02-10T09:00:00Z"));
        assert_eq!(rows[1].article_url, "https://x.test/b");
    }

    #[test]
    fn test_empty_window() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("crawler.db");
        seed_audit_db(&db, &[]);

        let reader = AuditReader::open(&db).unwrap();
        let from = utc("2026-02-10T00:00:00Z");
        let to = utc("2026-02-11T00:00:00Z");
        assert_eq!(reader.distinct_article_count(from, to).unwrap(), 0);
        assert!(reader.rows_in_window(from, to).unwrap().is_empty());
    }
}
