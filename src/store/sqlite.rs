//! SQLite-backed report store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};

use super::{Report, ReportStatus, ReportStore, ReportUpdate, StoreError};

pub const DEFAULT_STORE_FILE: &str = ".intake_reports.sqlite";

const COLUMNS: &str = "id, status, intake_data, stage1_output, stage2_output, stage3_output, \
                       stage4_output, share_token, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteReportStore {
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread waits
    /// on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl SqliteReportStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    /// Store file used when `REPORT_STORE_PATH` is unset.
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_STORE_FILE)
    }

    /// Lock the connection. A poisoned mutex still guards a usable
    /// connection, so recover it.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, StoreError> {
        self.sem.acquire().await.map_err(|_| StoreError::Closed)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self.permit().await?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reports (\
               id TEXT PRIMARY KEY,\
               status TEXT NOT NULL DEFAULT 'pending',\
               intake_data TEXT NOT NULL,\
               stage1_output TEXT,\
               stage2_output TEXT,\
               stage3_output TEXT,\
               stage4_output TEXT,\
               share_token TEXT UNIQUE,\
               created_at TEXT NOT NULL,\
               updated_at TEXT NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status);",
        )?;
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

struct RawRow {
    id: String,
    status: String,
    intake_data: String,
    outputs: [Option<String>; 4],
    share_token: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            intake_data: row.get(2)?,
            outputs: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
            share_token: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_report(self) -> Result<Report, StoreError> {
        let [s1, s2, s3, s4] = self.outputs;
        Ok(Report {
            status: self.status.parse()?,
            intake_data: serde_json::from_str(&self.intake_data)?,
            stage1_output: parse_json(s1)?,
            stage2_output: parse_json(s2)?,
            stage3_output: parse_json(s3)?,
            stage4_output: parse_json(s4)?,
            share_token: self.share_token,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            id: self.id,
        })
    }
}

fn parse_json(text: Option<String>) -> Result<Option<Value>, StoreError> {
    text.map(|t| serde_json::from_str(&t)).transpose().map_err(Into::into)
}

fn to_json(value: Option<&Value>) -> Result<Option<String>, StoreError> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp `{text}`: {e}")))
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `column` is always one of this module's constants.
fn select_one(conn: &Connection, column: &str, key: &str) -> Result<Option<Report>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM reports WHERE {column} = ?1");
    conn.query_row(&sql, params![key], RawRow::from_row)
        .optional()?
        .map(RawRow::into_report)
        .transpose()
}

// =============================================================================
// ReportStore impl
// =============================================================================

#[async_trait]
impl ReportStore for SqliteReportStore {
    async fn create(&self, report: Report) -> Result<Report, StoreError> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO reports (id, status, intake_data, stage1_output, stage2_output, \
                 stage3_output, stage4_output, share_token, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    report.id,
                    report.status.as_str(),
                    serde_json::to_string(&report.intake_data)?,
                    to_json(report.stage1_output.as_ref())?,
                    to_json(report.stage2_output.as_ref())?,
                    to_json(report.stage3_output.as_ref())?,
                    to_json(report.stage4_output.as_ref())?,
                    report.share_token,
                    format_time(&report.created_at),
                    format_time(&report.updated_at),
                ],
            )?;
            Ok(report)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Report, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            select_one(conn, "id", &id)?.ok_or_else(|| StoreError::not_found(&id))
        })
        .await
    }

    async fn update(&self, id: &str, update: ReportUpdate) -> Result<Report, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut report =
                select_one(&tx, "id", &id)?.ok_or_else(|| StoreError::not_found(&id))?;
            StoreError::check_expected(&id, &update, report.status)?;

            let previous = report.status;
            report.apply(&update, Utc::now());
            let rows = tx.execute(
                "UPDATE reports SET status = ?1, stage1_output = ?2, stage2_output = ?3, \
                 stage3_output = ?4, stage4_output = ?5, share_token = ?6, updated_at = ?7 \
                 WHERE id = ?8 AND status = ?9",
                params![
                    report.status.as_str(),
                    to_json(report.stage1_output.as_ref())?,
                    to_json(report.stage2_output.as_ref())?,
                    to_json(report.stage3_output.as_ref())?,
                    to_json(report.stage4_output.as_ref())?,
                    report.share_token,
                    format_time(&report.updated_at),
                    id,
                    previous.as_str(),
                ],
            )?;
            if rows == 0 {
                // Another connection moved the status between read and write.
                let actual: String = tx.query_row(
                    "SELECT status FROM reports WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                return Err(StoreError::Conflict {
                    id,
                    expected: previous,
                    actual: actual.parse::<ReportStatus>()?,
                });
            }
            tx.commit()?;
            Ok(report)
        })
        .await
    }

    async fn find_by_share_token(&self, share_token: &str) -> Result<Report, StoreError> {
        let token = share_token.to_string();
        self.blocking(move |conn| {
            select_one(conn, "share_token", &token)?
                .ok_or_else(|| StoreError::NotFound(format!("share token {token}")))
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================
