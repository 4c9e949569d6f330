//! **Stage 3 — Financial Fetch**
//!
//! For every resolved (orgnr, companyId) pair, pull the company profile and
//! stage one record per reported year × period. A 404 is not an error: the
//! company simply has no filings. All records of one company are written in
//! a single transaction together with the profile metadata.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use bolag_core::models::{Checkpoint, CompanyStatus, Job, JobStage, StagingCompany};
use bolag_core::{EngineConfig, ScrapeError, ScrapeResult, StagingStore};

use crate::checkpoint::CheckpointManager;
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::session::UpstreamSession;
use crate::stages::{control_signal, truncate_error, ControlSignal, JobHandle, StageExit};
use crate::wire::{CompanyProfile, CompanyProfilePage, NextDataResponse};

pub struct FinancialsStage {
    session: Arc<UpstreamSession>,
    limiter: Arc<AdaptiveRateLimiter>,
    store: StagingStore,
    config: EngineConfig,
}

impl FinancialsStage {
    pub fn new(
        session: Arc<UpstreamSession>,
        limiter: Arc<AdaptiveRateLimiter>,
        store: StagingStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            session,
            limiter,
            store,
            config,
        }
    }

    pub async fn run(&self, job: &mut Job, handle: &JobHandle) -> ScrapeResult<StageExit> {
        let build_id = self.session.build_id().await?;
        let resolved = self
            .store
            .companies_by_status(job.id, CompanyStatus::IdResolved)
            .await?;
        info!(job_id = %job.id, companies = resolved.len(), "starting financial fetch");

        let mut checkpoint = match self.store.load_checkpoint(job.id, JobStage::Stage3).await? {
            Some(checkpoint) => checkpoint,
            None => Checkpoint::new(job.id, JobStage::Stage3),
        };
        let mut manager = CheckpointManager::new(self.store.clone(), self.config.checkpoint_interval);

        for company in &resolved {
            match control_signal(handle, &self.store, job.id).await? {
                ControlSignal::Continue => {}
                ControlSignal::Pause => {
                    self.flush(&mut checkpoint, &mut manager, job).await?;
                    return Ok(StageExit::Paused);
                }
                ControlSignal::Stop => {
                    self.flush(&mut checkpoint, &mut manager, job).await?;
                    return Ok(StageExit::Stopped);
                }
            }

            let outcome = self
                .limiter
                .execute(|| self.fetch_profile(&build_id, company))
                .await;

            match outcome {
                Ok(Some(profile)) => {
                    self.stage_profile(job, company, &profile).await?;
                    job.processed_count += 1;
                }
                Ok(None) => {
                    // no filings upstream; the company is still done
                    debug!(orgnr = %company.orgnr, "company has no filings");
                    self.store
                        .set_company_status(
                            job.id,
                            &company.orgnr,
                            CompanyStatus::FinancialsFetched,
                            None,
                        )
                        .await?;
                    job.processed_count += 1;
                }
                Err(err) if err.is_fatal_for_job() => {
                    self.flush(&mut checkpoint, &mut manager, job).await?;
                    return Err(err);
                }
                Err(err) => {
                    warn!(orgnr = %company.orgnr, error = %err, "financial fetch failed");
                    job.error_count += 1;
                    job.last_error = Some(truncate_error(&format!("{}: {}", company.orgnr, err)));
                    self.store
                        .set_company_status(
                            job.id,
                            &company.orgnr,
                            CompanyStatus::Error,
                            Some(&truncate_error(&err.to_string())),
                        )
                        .await?;
                }
            }

            checkpoint.processed_count += 1;
            checkpoint.error_count = job.error_count;
            checkpoint.last_processed_company = Some(company.orgnr.clone());
            checkpoint.updated_at = Utc::now();
            manager.record(&checkpoint, 1, false).await;
        }

        self.flush(&mut checkpoint, &mut manager, job).await?;
        info!(job_id = %job.id, "financial fetch finished");
        Ok(StageExit::Completed)
    }

    async fn flush(
        &self,
        checkpoint: &mut Checkpoint,
        manager: &mut CheckpointManager,
        job: &mut Job,
    ) -> ScrapeResult<()> {
        checkpoint.updated_at = Utc::now();
        manager.record(checkpoint, 0, true).await;
        self.store.update_job_progress(job).await
    }

    /// Stage all reports and the metadata block for one company in a single
    /// transaction each, then advance the row.
    async fn stage_profile(
        &self,
        job: &Job,
        company: &StagingCompany,
        profile: &CompanyProfile,
    ) -> ScrapeResult<()> {
        let company_id = company
            .company_id
            .as_deref()
            .ok_or_else(|| ScrapeError::storage("resolved company without companyId"))?;

        let records: Vec<_> = profile
            .company_accounts
            .iter()
            .filter_map(|report| report.to_record(job.id, company_id, &company.orgnr))
            .collect();
        let staged = self.store.upsert_financials(&records).await?;
        self.store
            .upsert_details(&profile.to_details(job.id, &company.orgnr))
            .await?;
        self.store
            .set_company_status(job.id, &company.orgnr, CompanyStatus::FinancialsFetched, None)
            .await?;
        debug!(orgnr = %company.orgnr, reports = staged, "staged financials");
        Ok(())
    }

    /// Fetch the company profile. `Ok(None)` means 404 / no profile.
    async fn fetch_profile(
        &self,
        build_id: &str,
        company: &StagingCompany,
    ) -> ScrapeResult<Option<CompanyProfile>> {
        let company_id = company
            .company_id
            .as_deref()
            .ok_or_else(|| ScrapeError::storage("resolved company without companyId"))?;
        let industry = company
            .segment_name
            .first()
            .map(String::as_str)
            .unwrap_or("-");
        let url = format!(
            "{}/_next/data/{}/company/{}.json?companyId={}&name={}&industry={}&location=-",
            self.session.base_url(),
            build_id,
            company_id,
            company_id,
            urlencoding::encode(&company.company_name),
            urlencoding::encode(industry),
        );

        for attempt in 1..=2u32 {
            let session = self.session.current().await?;
            let response = self
                .session
                .gateway()
                .fetch(&url, &session.headers("application/json"))
                .await?;
            if response.status == 404 {
                return Ok(None);
            }
            let response = response.ensure_success()?;
            match serde_json::from_str::<NextDataResponse<CompanyProfilePage>>(&response.body) {
                Ok(parsed) => return Ok(parsed.page_props.company),
                Err(err) if attempt == 1 => {
                    warn!(orgnr = %company.orgnr, error = %err, "unexpected profile payload, refreshing session");
                    self.session.acquire().await?;
                }
                Err(err) => return Err(ScrapeError::parse(err.to_string())),
            }
        }
        Err(ScrapeError::parse("profile payload unparseable"))
    }
}
