//! **Staging Store**
//!
//! Embedded, crash-safe persistence for one job: the job row itself, staged
//! companies, id mappings, financial records, checkpoints, and migration
//! runs. Each job owns a single SQLite file under the staging directory
//! (`staging/staging_<jobId>.db`), opened in WAL mode.
//!
//! The store has a single write connection guarded by an async mutex; batch
//! writes from the pipeline run inside one transaction so a process crash can
//! never leave a partially applied batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ScrapeResult;

mod checkpoints;
mod companies;
mod financials;
mod jobs;
mod schema;

/// Handle to one job's staging file. Cheap to clone; all clones share the
/// same serialized write connection.
#[derive(Clone)]
pub struct StagingStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl StagingStore {
    /// Open (or create) the staging file for a job under `staging_dir`.
    pub fn open(staging_dir: &Path, job_id: Uuid) -> ScrapeResult<Self> {
        std::fs::create_dir_all(staging_dir)?;
        let path = Self::staging_path(staging_dir, job_id);
        Self::open_path(&path)
    }

    /// Open a staging file at an explicit path.
    pub fn open_path(path: &Path) -> ScrapeResult<Self> {
        let conn = Connection::open(path)?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> ScrapeResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn prepare(conn: &Connection) -> ScrapeResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        schema::apply(conn)
    }

    /// Canonical staging file path for a job.
    pub fn staging_path(staging_dir: &Path, job_id: Uuid) -> PathBuf {
        staging_dir.join(format!("staging_{}.db", job_id))
    }

    /// Whether a staging file already exists for a job.
    pub fn exists(staging_dir: &Path, job_id: Uuid) -> bool {
        Self::staging_path(staging_dir, job_id).exists()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }
}

/// Per-stage progress counts for a job, derived from staged row states.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgressSummary {
    pub total_companies: i64,
    pub pending: i64,
    pub id_resolved: i64,
    pub financials_fetched: i64,
    pub errored: i64,
    pub financial_rows: i64,
}

/// One failed company with a derived human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRow {
    pub orgnr: String,
    pub company_name: String,
    pub reason: String,
    pub error_message: Option<String>,
}

/// Page of companies returned by the listing query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyPage {
    pub rows: Vec<crate::models::StagingCompany>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

/// Options for the company listing query.
#[derive(Debug, Clone, Default)]
pub struct CompanyListOptions {
    pub status: Option<crate::models::CompanyStatus>,
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

/// Summary row persisted for each migrate run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub include_warnings: bool,
    pub skip_duplicates: bool,
    pub migrated: i64,
    pub skipped: i64,
    pub errors: i64,
    pub report: Vec<String>,
}
