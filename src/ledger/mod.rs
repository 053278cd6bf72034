//! Download ledger
//!
//! Durable record of every verified download, keyed by
//! `(file_name, file_size, server_name)`. Lookups are exact on all three
//! fields. Every call is serialized on one lock around the SQLite handle;
//! "check, download, record" is deliberately not one transaction, so two
//! connections racing on the same new file may both fetch it.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Records older than this are removed by [`Ledger::purge_expired`]
pub const RETENTION_DAYS: i64 = 7;

/// Largest page size [`Ledger::list`] accepts
pub const MAX_PAGE_LIMIT: u32 = 100;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS downloaded_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL,
    server_name TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    download_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_downloaded_files_key
    ON downloaded_files (file_name, file_size, server_name);
CREATE INDEX IF NOT EXISTS idx_downloaded_files_time
    ON downloaded_files (download_time);
";

/// One verified download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub file_name: String,
    pub file_size: u64,
    pub server_name: String,
    pub downloaded_at: DateTime<Utc>,
}

impl DownloadRecord {
    /// Record stamped with the current time, truncated to whole seconds
    pub fn now(
        file_name: impl Into<String>,
        file_size: u64,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            server_name: server_name.into(),
            downloaded_at: truncate_to_seconds(Utc::now()),
        }
    }
}

/// One page of records, most recent first
#[derive(Debug, Clone, Serialize)]
pub struct LedgerPage {
    pub records: Vec<DownloadRecord>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Shared handle to the ledger database
pub struct Ledger {
    conn: Mutex<Option<Connection>>,
}

impl Ledger {
    /// Open (creating if needed) the ledger database at `path`
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let ledger = Self::init(conn)?;
        tracing::debug!("Opened download ledger at {}", path.display());
        Ok(ledger)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| AppError::Ledger("ledger is closed".to_string()))?;
        f(conn)
    }

    /// Whether a record with exactly this key exists
    pub fn exists(&self, file_name: &str, file_size: u64, server_name: &str) -> AppResult<bool> {
        let size = size_to_sql(file_size)?;
        self.with_conn(|conn| {
            let found = conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM downloaded_files
                     WHERE file_name = ?1 AND file_size = ?2 AND server_name = ?3
                 )",
                params![file_name, size, server_name],
                |row| row.get::<_, bool>(0),
            )?;
            Ok(found)
        })
    }

    /// Durably store `record`. Any failure is reported as [`AppError::LedgerWrite`].
    pub fn record(&self, record: &DownloadRecord) -> AppResult<()> {
        let write = || -> AppResult<()> {
            let size = size_to_sql(record.file_size)?;
            let stamp = record.downloaded_at.format(TIME_FORMAT).to_string();
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO downloaded_files (file_name, server_name, file_size, download_time)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![record.file_name, record.server_name, size, stamp],
                )?;
                Ok(())
            })
        };
        write().map_err(|e| {
            AppError::LedgerWrite(format!(
                "{} ({} bytes) from {}: {}",
                record.file_name, record.file_size, record.server_name, e
            ))
        })
    }

    /// Records ordered most recent first. `page` starts at 1.
    pub fn list(&self, page: u32, limit: u32) -> AppResult<LedgerPage> {
        if page == 0 {
            return Err(AppError::InvalidConfig("page must be 1 or greater".to_string()));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(AppError::InvalidConfig(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        let offset = (i64::from(page) - 1) * i64::from(limit);

        self.with_conn(|conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM downloaded_files", [], |row| row.get(0))?;

            let mut stmt = conn.prepare(
                "SELECT file_name, file_size, server_name, download_time
                 FROM downloaded_files
                 ORDER BY download_time DESC, id DESC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let records = stmt
                .query_map(params![limit, offset], |row| {
                    let size: i64 = row.get(1)?;
                    let stamp: String = row.get(3)?;
                    Ok(DownloadRecord {
                        file_name: row.get(0)?,
                        file_size: size.max(0) as u64,
                        server_name: row.get(2)?,
                        downloaded_at: parse_time(&stamp).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                        })?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(LedgerPage {
                records,
                total: total.max(0) as u64,
                page,
                limit,
            })
        })
    }

    pub fn count(&self) -> AppResult<u64> {
        self.with_conn(|conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM downloaded_files", [], |row| row.get(0))?;
            Ok(total.max(0) as u64)
        })
    }

    /// Delete every record, returning how many were removed
    pub fn clear(&self) -> AppResult<usize> {
        let removed = self.with_conn(|conn| Ok(conn.execute("DELETE FROM downloaded_files", [])?))?;
        tracing::info!("Cleared {} ledger records", removed);
        Ok(removed)
    }

    /// Delete records downloaded strictly before `cutoff`
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let stamp = cutoff.format(TIME_FORMAT).to_string();
        let removed = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM downloaded_files WHERE download_time < ?1",
                params![stamp],
            )?)
        })?;
        tracing::info!("Purged {} ledger records older than {}", removed, stamp);
        Ok(removed)
    }

    /// Delete records older than the retention horizon
    pub fn purge_expired(&self) -> AppResult<usize> {
        self.purge_before(Utc::now() - Duration::days(RETENTION_DAYS))
    }

    /// Release the database handle. Later calls fail with a ledger error.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Failed to close download ledger: {}", e);
            } else {
                tracing::debug!("Download ledger closed");
            }
        }
    }
}

#[cfg(test)]
impl Ledger {
    /// Make every insert fail while lookups keep working
    pub(crate) fn reject_writes(&self) {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_writes BEFORE INSERT ON downloaded_files
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )?;
            Ok(())
        })
        .unwrap();
    }
}

fn size_to_sql(size: u64) -> AppResult<i64> {
    i64::try_from(size).map_err(|_| AppError::Ledger(format!("file size out of range: {}", size)))
}

fn parse_time(stamp: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(stamp, TIME_FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
}

fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap_or(at)
}
