//! Job persistence and job-level derived queries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{Job, JobStage, JobStatus, JobType};

use super::{FailureRow, JobProgressSummary, StagingStore};

impl StagingStore {
    /// Insert the job row. Called exactly once, by the job controller.
    pub async fn insert_job(&self, job: &Job) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        conn.execute(
            "INSERT INTO jobs (id, job_type, filter_hash, params, status, stage, last_page,
                               processed_count, total_companies, error_count, last_error,
                               rate_limit_stats, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id.to_string(),
                job.job_type.to_string(),
                job.filter_hash,
                serde_json::to_string(&job.params)?,
                job.status.to_string(),
                job.stage.to_string(),
                job.last_page,
                job.processed_count,
                job.total_companies,
                job.error_count,
                job.last_error,
                job.rate_limit_stats
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> ScrapeResult<Option<Job>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, job_type, filter_hash, params, status, stage, last_page,
                    processed_count, total_companies, error_count, last_error,
                    rate_limit_stats, created_at, updated_at
             FROM jobs WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![job_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    /// Like `get_job` but a missing row is an error.
    pub async fn require_job(&self, job_id: Uuid) -> ScrapeResult<Job> {
        self.get_job(job_id)
            .await?
            .ok_or(ScrapeError::JobNotFound(job_id))
    }

    /// Persist the progress fields of a job. Status and stage are left
    /// untouched: only the job controller mutates those, through
    /// `set_job_status` and `set_job_stage`.
    pub async fn update_job_progress(&self, job: &Job) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        let updated = conn.execute(
            "UPDATE jobs SET last_page = ?2, processed_count = ?3, total_companies = ?4,
                             error_count = ?5, last_error = ?6, rate_limit_stats = ?7,
                             updated_at = ?8
             WHERE id = ?1",
            params![
                job.id.to_string(),
                job.last_page,
                job.processed_count,
                job.total_companies,
                job.error_count,
                job.last_error,
                job.rate_limit_stats
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                Utc::now(),
            ],
        )?;
        if updated == 0 {
            return Err(ScrapeError::JobNotFound(job.id));
        }
        Ok(())
    }

    /// Write a status transition. The transition must be legal for the
    /// current persisted status.
    pub async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> ScrapeResult<()> {
        let current = self
            .job_status(job_id)
            .await?
            .ok_or(ScrapeError::JobNotFound(job_id))?;
        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(ScrapeError::storage(format!(
                "illegal job status transition {} -> {}",
                current, status
            )));
        }
        let conn = self.connection().lock().await;
        conn.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id.to_string(), status.to_string(), Utc::now()],
        )?;
        Ok(())
    }

    /// Advance the job's stage marker (only ever between stages).
    pub async fn set_job_stage(&self, job_id: Uuid, stage: JobStage) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        let updated = conn.execute(
            "UPDATE jobs SET stage = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id.to_string(), stage.to_string(), Utc::now()],
        )?;
        if updated == 0 {
            return Err(ScrapeError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Current status only; polled by stage workers between requests.
    pub async fn job_status(&self, job_id: Uuid) -> ScrapeResult<Option<JobStatus>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached("SELECT status FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query(params![job_id.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let status: String = row.get(0)?;
                Ok(Some(JobStatus::from(status)))
            }
            None => Ok(None),
        }
    }

    /// Per-stage progress derived from the staged row states. Row states are
    /// the durable source of truth, so this survives lost checkpoints.
    pub async fn job_summary(&self, job_id: Uuid) -> ScrapeResult<JobProgressSummary> {
        let conn = self.connection().lock().await;
        let job_key = job_id.to_string();

        let mut summary = JobProgressSummary::default();
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM companies WHERE job_id = ?1 GROUP BY status",
        )?;
        let mut rows = stmt.query(params![job_key])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            summary.total_companies += count;
            match status.as_str() {
                "pending" => summary.pending = count,
                "id_resolved" => summary.id_resolved = count,
                "financials_fetched" => summary.financials_fetched = count,
                "error" => summary.errored = count,
                _ => {}
            }
        }

        summary.financial_rows = conn.query_row(
            "SELECT COUNT(*) FROM financial_records WHERE job_id = ?1",
            params![job_key],
            |row| row.get(0),
        )?;

        Ok(summary)
    }

    /// Errored companies with a reason derived from how far the row got.
    pub async fn list_failures(&self, job_id: Uuid) -> ScrapeResult<Vec<FailureRow>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT c.orgnr, c.company_name, c.company_id, c.error_message,
                    m.status AS mapping_status
             FROM companies c
             LEFT JOIN company_id_mappings m ON m.job_id = c.job_id AND m.orgnr = c.orgnr
             WHERE c.job_id = ?1 AND c.status = 'error'
             ORDER BY c.rowid",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| {
            let orgnr: String = row.get(0)?;
            let company_name: String = row.get(1)?;
            let company_id: Option<String> = row.get(2)?;
            let error_message: Option<String> = row.get(3)?;
            let mapping_status: Option<String> = row.get(4)?;
            Ok((orgnr, company_name, company_id, error_message, mapping_status))
        })?;

        let mut failures = Vec::new();
        for row in rows {
            let (orgnr, company_name, company_id, error_message, mapping_status) = row?;
            let id_resolved =
                company_id.is_some() || mapping_status.as_deref() == Some("resolved");
            let reason = if id_resolved {
                "Stage 3 financials not fetched"
            } else {
                "Stage 2 companyId not resolved"
            };
            failures.push(FailureRow {
                orgnr,
                company_name,
                reason: reason.to_string(),
                error_message,
            });
        }
        Ok(failures)
    }
}

fn row_to_job(row: &Row<'_>) -> ScrapeResult<Job> {
    let id: String = row.get(0)?;
    let job_type: String = row.get(1)?;
    let params_json: String = row.get(3)?;
    let status: String = row.get(4)?;
    let stage: String = row.get(5)?;
    let rate_limit_stats: Option<String> = row.get(11)?;
    let created_at: DateTime<Utc> = row.get(12)?;
    let updated_at: DateTime<Utc> = row.get(13)?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| ScrapeError::storage(e.to_string()))?,
        job_type: JobType::from(job_type),
        filter_hash: row.get(2)?,
        params: serde_json::from_str(&params_json)?,
        status: JobStatus::from(status),
        stage: JobStage::from(stage),
        last_page: row.get(6)?,
        processed_count: row.get(7)?,
        total_companies: row.get(8)?,
        error_count: row.get(9)?,
        last_error: row.get(10)?,
        rate_limit_stats: rate_limit_stats
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        created_at,
        updated_at,
    })
}
