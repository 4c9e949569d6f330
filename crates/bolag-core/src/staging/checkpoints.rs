//! Checkpoint persistence: per-(job, stage) progress snapshots.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{Checkpoint, JobStage, ResumeInfo};

use super::StagingStore;

const CHECKPOINT_COLUMNS: &str = "job_id, stage, last_processed_page, last_processed_company,
    processed_count, error_count, last_error, data, updated_at";

impl StagingStore {
    /// Upsert the checkpoint for (job, stage).
    ///
    /// `processed_count` is monotonic: a snapshot that would move it
    /// backwards is dropped (progress reconstruction falls back to the
    /// staged row states, so a stale writer must not rewind the cursor).
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT processed_count FROM checkpoints WHERE job_id = ?1 AND stage = ?2",
                params![checkpoint.job_id.to_string(), checkpoint.stage.to_string()],
                |row| row.get(0),
            )
            .ok();
        if let Some(existing) = existing {
            if checkpoint.processed_count < existing {
                debug!(
                    job_id = %checkpoint.job_id,
                    stage = %checkpoint.stage,
                    existing,
                    incoming = checkpoint.processed_count,
                    "dropping checkpoint that would rewind progress"
                );
                return Ok(());
            }
        }
        conn.execute(
            "INSERT INTO checkpoints (job_id, stage, last_processed_page, last_processed_company,
                                      processed_count, error_count, last_error, data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(job_id, stage) DO UPDATE SET
                last_processed_page = excluded.last_processed_page,
                last_processed_company = excluded.last_processed_company,
                processed_count = excluded.processed_count,
                error_count = excluded.error_count,
                last_error = excluded.last_error,
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![
                checkpoint.job_id.to_string(),
                checkpoint.stage.to_string(),
                checkpoint.last_processed_page,
                checkpoint.last_processed_company,
                checkpoint.processed_count,
                checkpoint.error_count,
                checkpoint.last_error,
                checkpoint
                    .data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                checkpoint.updated_at,
            ],
        )?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        job_id: Uuid,
        stage: JobStage,
    ) -> ScrapeResult<Option<Checkpoint>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM checkpoints WHERE job_id = ?1 AND stage = ?2",
            CHECKPOINT_COLUMNS
        ))?;
        let mut rows = stmt.query(params![job_id.to_string(), stage.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated checkpoint across all stages of a job.
    pub async fn latest_checkpoint(&self, job_id: Uuid) -> ScrapeResult<Option<Checkpoint>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM checkpoints WHERE job_id = ?1 ORDER BY updated_at DESC LIMIT 1",
            CHECKPOINT_COLUMNS
        ))?;
        let mut rows = stmt.query(params![job_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    /// Join job status with the latest checkpoint into resume information.
    pub async fn resume_info(&self, job_id: Uuid) -> ScrapeResult<ResumeInfo> {
        let job = self.require_job(job_id).await?;
        let checkpoint = self.latest_checkpoint(job_id).await?;
        let (last_stage, last_page, processed_count) = match checkpoint {
            Some(cp) => (cp.stage, cp.last_processed_page, cp.processed_count),
            None => (job.stage, job.last_page, job.processed_count),
        };
        Ok(ResumeInfo {
            can_resume: !job.status.is_terminal(),
            last_stage,
            last_page,
            processed_count,
            total_companies: job.total_companies,
        })
    }
}

fn row_to_checkpoint(row: &Row<'_>) -> ScrapeResult<Checkpoint> {
    let job_key: String = row.get(0)?;
    let stage: String = row.get(1)?;
    let data: Option<String> = row.get(7)?;
    let updated_at: DateTime<Utc> = row.get(8)?;
    Ok(Checkpoint {
        job_id: Uuid::parse_str(&job_key).map_err(|e| ScrapeError::storage(e.to_string()))?,
        stage: JobStage::from(stage),
        last_processed_page: row.get(2)?,
        last_processed_company: row.get(3)?,
        processed_count: row.get(4)?,
        error_count: row.get(5)?,
        last_error: row.get(6)?,
        data: data.map(|raw| serde_json::from_str(&raw)).transpose()?,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Filters, Job, JobType};

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = Uuid::new_v4();
        let mut checkpoint = Checkpoint::new(job_id, JobStage::Stage1);
        checkpoint.last_processed_page = 17;
        checkpoint.processed_count = 340;
        checkpoint.data = Some(serde_json::json!({"emptyStreak": 1}));

        store.save_checkpoint(&checkpoint).await.unwrap();
        let loaded = store
            .load_checkpoint(job_id, JobStage::Stage1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_processed_page, 17);
        assert_eq!(loaded.processed_count, 340);
        assert_eq!(loaded.data, Some(serde_json::json!({"emptyStreak": 1})));
    }

    #[tokio::test]
    async fn test_processed_count_never_decreases() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = Uuid::new_v4();
        let mut checkpoint = Checkpoint::new(job_id, JobStage::Stage3);
        checkpoint.processed_count = 220;
        store.save_checkpoint(&checkpoint).await.unwrap();

        checkpoint.processed_count = 210;
        store.save_checkpoint(&checkpoint).await.unwrap();

        let loaded = store
            .load_checkpoint(job_id, JobStage::Stage3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.processed_count, 220);
    }

    #[tokio::test]
    async fn test_resume_info_prefers_latest_checkpoint() {
        let store = StagingStore::open_in_memory().unwrap();
        let job = Job::new(
            JobType::FullPipeline,
            Filters::from_msek(100, 500, None, None),
        )
        .unwrap();
        store.insert_job(&job).await.unwrap();

        let mut stage1 = Checkpoint::new(job.id, JobStage::Stage1);
        stage1.last_processed_page = 53;
        stage1.processed_count = 500;
        stage1.updated_at = Utc::now() - chrono::Duration::minutes(5);
        store.save_checkpoint(&stage1).await.unwrap();

        let mut stage3 = Checkpoint::new(job.id, JobStage::Stage3);
        stage3.processed_count = 220;
        stage3.updated_at = Utc::now();
        store.save_checkpoint(&stage3).await.unwrap();

        let info = store.resume_info(job.id).await.unwrap();
        assert!(info.can_resume);
        assert_eq!(info.last_stage, JobStage::Stage3);
        assert_eq!(info.processed_count, 220);
    }

    #[tokio::test]
    async fn test_resume_info_for_unknown_job_is_not_found() {
        let store = StagingStore::open_in_memory().unwrap();
        assert!(matches!(
            store.resume_info(Uuid::new_v4()).await,
            Err(ScrapeError::JobNotFound(_))
        ));
    }
}
