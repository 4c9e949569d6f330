//! **Job Controller**
//!
//! The only component that creates jobs and moves their status and stage.
//! Stages report progress and errors through the store and checkpoints; the
//! controller turns stage exits and failures into status transitions, keeps
//! the in-memory pause/stop handles, and exposes the operator verbs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use bolag_core::models::{Filters, Job, JobStage, JobStatus, JobType, ResumeInfo};
use bolag_core::{
    CompanyListOptions, CompanyPage, EngineConfig, FailureRow, JobProgressSummary, ProxyConfig,
    ScrapeError, ScrapeResult, StagingStore,
};

use crate::migrator::{MigrateOptions, MigrationSummary, Migrator, ProductionStore};
use crate::proxy::{GatewayStats, ProxyGateway};
use crate::rate_limiter::{AdaptiveRateLimiter, StageLimits};
use crate::session::UpstreamSession;
use crate::stages::financials::FinancialsStage;
use crate::stages::id_resolution::IdResolutionStage;
use crate::stages::segmentation::{SegmentationPreview, SegmentationStage};
use crate::stages::{JobHandle, StageExit};
use crate::validator::{validate_job, ValidationSummary};

/// Job state as surfaced to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub stage: JobStage,
    pub last_page: i64,
    pub processed_count: i64,
    pub total_companies: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub rate_limit_stats: Option<serde_json::Value>,
    pub summary: JobProgressSummary,
}

#[derive(Clone)]
pub struct JobController {
    config: EngineConfig,
    session: Arc<UpstreamSession>,
    gateway: Arc<ProxyGateway>,
    stage1_limiter: Arc<AdaptiveRateLimiter>,
    stage2_limiter: Arc<AdaptiveRateLimiter>,
    stage3_limiter: Arc<AdaptiveRateLimiter>,
    production: Arc<dyn ProductionStore>,
    handles: Arc<Mutex<HashMap<Uuid, Arc<JobHandle>>>>,
}

impl JobController {
    pub fn new(
        config: EngineConfig,
        proxy_config: ProxyConfig,
        base_url: impl Into<String>,
        production: Arc<dyn ProductionStore>,
    ) -> Self {
        let gateway = Arc::new(ProxyGateway::new(
            proxy_config,
            Duration::from_secs(config.request_timeout_secs),
        ));
        let session = Arc::new(UpstreamSession::new(gateway.clone(), base_url));
        Self {
            config,
            session,
            gateway,
            stage1_limiter: Arc::new(AdaptiveRateLimiter::new("stage1", StageLimits::stage1())),
            stage2_limiter: Arc::new(AdaptiveRateLimiter::new("stage2", StageLimits::stage2())),
            stage3_limiter: Arc::new(AdaptiveRateLimiter::new("stage3", StageLimits::stage3())),
            production,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn gateway_stats(&self) -> GatewayStats {
        self.gateway.stats()
    }

    /// Single-page probe of the segmentation listing; allowed without an
    /// enabled proxy provider.
    pub async fn preview_segmentation(&self, filters: &Filters) -> ScrapeResult<SegmentationPreview> {
        let scratch = StagingStore::open_in_memory()?;
        SegmentationStage::new(
            self.session.clone(),
            self.stage1_limiter.clone(),
            scratch,
            self.config.clone(),
        )
        .preview(filters)
        .await
    }

    /// Create the job, mark it running, and drive it asynchronously.
    /// Returns the job id immediately.
    pub async fn start_job(&self, filters: Filters, job_type: JobType) -> ScrapeResult<Uuid> {
        self.gateway.require_proxy_for_jobs()?;
        let job = Job::new(job_type, filters)?;
        let store = StagingStore::open(&self.config.staging_dir, job.id)?;
        store.insert_job(&job).await?;
        store.set_job_status(job.id, JobStatus::Running).await?;

        let handle = self.register_handle(job.id);
        let controller = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            controller.run_pipeline(job_id, store, handle).await;
        });
        info!(%job_id, %job_type, "job started");
        Ok(job_id)
    }

    /// Whether a worker task for this job is still alive in this process.
    pub fn is_live(&self, job_id: Uuid) -> bool {
        self.handles
            .lock()
            .expect("handle registry lock")
            .contains_key(&job_id)
    }

    /// Re-enter the last non-done stage of a paused or errored job.
    pub async fn resume(&self, job_id: Uuid) -> ScrapeResult<ResumeInfo> {
        if self.is_live(job_id) {
            return Err(ScrapeError::configuration(format!(
                "job {} is still winding down; retry shortly",
                job_id
            )));
        }
        let store = self.store_for(job_id)?;
        let job = store.require_job(job_id).await?;
        if !job.status.is_resumable() {
            return Err(ScrapeError::configuration(format!(
                "job {} is {} and cannot be resumed",
                job_id, job.status
            )));
        }
        self.gateway.require_proxy_for_jobs()?;
        let info = store.resume_info(job_id).await?;
        store.set_job_status(job_id, JobStatus::Running).await?;

        let handle = self.register_handle(job_id);
        handle.clear_pause();
        let controller = self.clone();
        tokio::spawn(async move {
            controller.run_pipeline(job_id, store, handle).await;
        });
        info!(%job_id, stage = %info.last_stage, "job resumed");
        Ok(info)
    }

    /// Cooperative pause; workers stop before their next request.
    pub async fn pause(&self, job_id: Uuid) -> ScrapeResult<()> {
        let store = self.store_for(job_id)?;
        if let Some(handle) = self.handle_for(job_id) {
            handle.request_pause();
        }
        store.set_job_status(job_id, JobStatus::Paused).await?;
        info!(%job_id, "job paused");
        Ok(())
    }

    /// Permanent stop; not resumable.
    pub async fn stop(&self, job_id: Uuid) -> ScrapeResult<()> {
        let store = self.store_for(job_id)?;
        if let Some(handle) = self.handle_for(job_id) {
            handle.request_stop();
        }
        store.set_job_status(job_id, JobStatus::Stopped).await?;
        info!(%job_id, "job stopped");
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> ScrapeResult<JobView> {
        let store = self.store_for(job_id)?;
        let job = store.require_job(job_id).await?;
        let summary = store.job_summary(job_id).await?;
        Ok(JobView {
            id: job.id,
            status: job.status,
            stage: job.stage,
            last_page: job.last_page,
            processed_count: job.processed_count,
            total_companies: job.total_companies,
            error_count: job.error_count,
            last_error: job.last_error,
            rate_limit_stats: job.rate_limit_stats,
            summary,
        })
    }

    pub async fn list_companies(
        &self,
        job_id: Uuid,
        options: &CompanyListOptions,
    ) -> ScrapeResult<CompanyPage> {
        let store = self.store_for(job_id)?;
        store.require_job(job_id).await?;
        store.list_companies(job_id, options).await
    }

    /// Failed companies with derived reasons, plus the job-level entry when
    /// stage 1 itself failed (there is no company row to carry that one).
    pub async fn list_errors(&self, job_id: Uuid) -> ScrapeResult<Vec<FailureRow>> {
        let store = self.store_for(job_id)?;
        let job = store.require_job(job_id).await?;
        let mut failures = Vec::new();
        if job.status == JobStatus::Error && job.stage == JobStage::Stage1 {
            failures.push(FailureRow {
                orgnr: String::new(),
                company_name: String::new(),
                reason: "Stage 1 segmentation failed".to_string(),
                error_message: job.last_error.clone(),
            });
        }
        failures.extend(store.list_failures(job_id).await?);
        Ok(failures)
    }

    pub async fn validate_job(&self, job_id: Uuid) -> ScrapeResult<ValidationSummary> {
        let store = self.store_for(job_id)?;
        store.require_job(job_id).await?;
        store.set_job_stage(job_id, JobStage::Validate).await?;
        validate_job(&store, job_id).await
    }

    pub async fn migrate_job(
        &self,
        job_id: Uuid,
        options: MigrateOptions,
    ) -> ScrapeResult<MigrationSummary> {
        let store = self.store_for(job_id)?;
        store.require_job(job_id).await?;
        store.set_job_stage(job_id, JobStage::Migrate).await?;
        Migrator::new(store, self.production.clone())
            .migrate(job_id, options)
            .await
    }

    async fn run_pipeline(&self, job_id: Uuid, store: StagingStore, handle: Arc<JobHandle>) {
        let result = self.drive_stages(job_id, &store, &handle).await;
        if let Err(err) = &result {
            error!(%job_id, error = %err, "pipeline failed");
            if let Ok(mut job) = store.require_job(job_id).await {
                job.last_error = Some(err.to_string());
                job.rate_limit_stats = Some(self.limiter_snapshot());
                let _ = store.update_job_progress(&job).await;
            }
            let _ = match err {
                ScrapeError::Stopped => store.set_job_status(job_id, JobStatus::Stopped).await,
                _ => store.set_job_status(job_id, JobStatus::Error).await,
            };
        }
        self.handles.lock().expect("handle registry lock").remove(&job_id);
    }

    async fn drive_stages(
        &self,
        job_id: Uuid,
        store: &StagingStore,
        handle: &JobHandle,
    ) -> ScrapeResult<()> {
        let mut job = store.require_job(job_id).await?;
        let stages = stages_for(&job);

        for stage in stages {
            store.set_job_stage(job_id, stage).await?;
            job.stage = stage;

            let exit = match stage {
                JobStage::Stage1 => {
                    SegmentationStage::new(
                        self.session.clone(),
                        self.stage1_limiter.clone(),
                        store.clone(),
                        self.config.clone(),
                    )
                    .run(&mut job, handle)
                    .await?
                }
                JobStage::Stage2 => {
                    IdResolutionStage::new(
                        self.session.clone(),
                        self.stage2_limiter.clone(),
                        store.clone(),
                        self.config.clone(),
                    )
                    .run(&mut job, handle)
                    .await?
                }
                JobStage::Stage3 => {
                    FinancialsStage::new(
                        self.session.clone(),
                        self.stage3_limiter.clone(),
                        store.clone(),
                        self.config.clone(),
                    )
                    .run(&mut job, handle)
                    .await?
                }
                // validate and migrate run through their own verbs
                JobStage::Validate | JobStage::Migrate => StageExit::Completed,
            };

            job.rate_limit_stats = Some(self.limiter_snapshot());
            store.update_job_progress(&job).await?;

            match exit {
                StageExit::Completed => {}
                StageExit::Paused => {
                    store.set_job_status(job_id, JobStatus::Paused).await?;
                    info!(%job_id, %stage, "pipeline paused");
                    return Ok(());
                }
                StageExit::Stopped => {
                    store.set_job_status(job_id, JobStatus::Stopped).await?;
                    info!(%job_id, %stage, "pipeline stopped");
                    return Ok(());
                }
            }
        }

        store.set_job_status(job_id, JobStatus::Done).await?;
        info!(%job_id, "pipeline done");
        Ok(())
    }

    fn limiter_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "stage1": self.stage1_limiter.stats(),
            "stage2": self.stage2_limiter.stats(),
            "stage3": self.stage3_limiter.stats(),
            "gateway": self.gateway.stats(),
        })
    }

    fn register_handle(&self, job_id: Uuid) -> Arc<JobHandle> {
        let handle = Arc::new(JobHandle::new());
        self.handles
            .lock()
            .expect("handle registry lock")
            .insert(job_id, handle.clone());
        handle
    }

    fn handle_for(&self, job_id: Uuid) -> Option<Arc<JobHandle>> {
        self.handles
            .lock()
            .expect("handle registry lock")
            .get(&job_id)
            .cloned()
    }

    fn store_for(&self, job_id: Uuid) -> ScrapeResult<StagingStore> {
        if !StagingStore::exists(&self.config.staging_dir, job_id) {
            return Err(ScrapeError::JobNotFound(job_id));
        }
        StagingStore::open(&self.config.staging_dir, job_id)
    }
}

/// The stage list a job still has to run, from its current stage on.
fn stages_for(job: &Job) -> Vec<JobStage> {
    let full: &[JobStage] = match job.job_type {
        JobType::Segmentation => &[JobStage::Stage1],
        JobType::IdResolution => &[JobStage::Stage2],
        JobType::Financials => &[JobStage::Stage3],
        JobType::FullPipeline => &[JobStage::Stage1, JobStage::Stage2, JobStage::Stage3],
    };
    full.iter()
        .copied()
        .skip_while(|stage| *stage != job.stage && job.stage != JobStage::Stage1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrator::InMemoryProductionStore;
    use tempfile::TempDir;

    fn controller_with(dir: &TempDir, base_url: &str) -> JobController {
        let config = EngineConfig {
            staging_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let proxy_config = ProxyConfig {
            vpn_enabled: true,
            ..Default::default()
        };
        JobController::new(
            config,
            proxy_config,
            base_url,
            Arc::new(InMemoryProductionStore::new()),
        )
    }

    #[test]
    fn test_stages_for_full_pipeline_resumes_mid_stage() {
        let mut job = Job::new(
            JobType::FullPipeline,
            Filters::from_msek(100, 500, None, None),
        )
        .unwrap();
        assert_eq!(
            stages_for(&job),
            vec![JobStage::Stage1, JobStage::Stage2, JobStage::Stage3]
        );

        job.stage = JobStage::Stage3;
        assert_eq!(stages_for(&job), vec![JobStage::Stage3]);

        job.job_type = JobType::Segmentation;
        job.stage = JobStage::Stage1;
        assert_eq!(stages_for(&job), vec![JobStage::Stage1]);
    }

    #[tokio::test]
    async fn test_start_requires_an_egress_mode() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            staging_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let controller = JobController::new(
            config,
            ProxyConfig::default(),
            "http://127.0.0.1:1",
            Arc::new(InMemoryProductionStore::new()),
        );
        let result = controller
            .start_job(Filters::from_msek(100, 500, None, None), JobType::Segmentation)
            .await;
        assert!(matches!(result, Err(ScrapeError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let controller = controller_with(&dir, "http://127.0.0.1:1");
        let missing = Uuid::new_v4();
        assert!(matches!(
            controller.get_job(missing).await,
            Err(ScrapeError::JobNotFound(_))
        ));
        assert!(matches!(
            controller.pause(missing).await,
            Err(ScrapeError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_rejects_terminal_jobs() {
        let dir = TempDir::new().unwrap();
        let controller = controller_with(&dir, "http://127.0.0.1:1");

        let job = Job::new(
            JobType::Segmentation,
            Filters::from_msek(100, 500, None, None),
        )
        .unwrap();
        let store = StagingStore::open(dir.path(), job.id).unwrap();
        store.insert_job(&job).await.unwrap();
        store.set_job_status(job.id, JobStatus::Running).await.unwrap();
        store.set_job_status(job.id, JobStatus::Done).await.unwrap();

        assert!(matches!(
            controller.resume(job.id).await,
            Err(ScrapeError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_marks_job_and_is_resumable_state() {
        let dir = TempDir::new().unwrap();
        let controller = controller_with(&dir, "http://127.0.0.1:1");

        let job = Job::new(
            JobType::Segmentation,
            Filters::from_msek(100, 500, None, None),
        )
        .unwrap();
        let store = StagingStore::open(dir.path(), job.id).unwrap();
        store.insert_job(&job).await.unwrap();
        store.set_job_status(job.id, JobStatus::Running).await.unwrap();

        controller.pause(job.id).await.unwrap();
        let view = controller.get_job(job.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Paused);

        controller.stop(job.id).await.unwrap();
        let view = controller.get_job(job.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Stopped);
        // a stopped job is permanently not resumable
        assert!(controller.resume(job.id).await.is_err());
    }
}
