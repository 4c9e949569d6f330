//! **Stage 1 — Segmentation**
//!
//! Paginates the filter-based listing, normalizes the company DTOs, and
//! stages them. Pages are fetched in batches with bounded fan-out, each batch
//! is written in a single transaction, and a checkpoint plus the job row
//! track the last fully processed page so an interrupted run restarts where
//! it left off.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use bolag_core::models::{Checkpoint, Filters, Job, JobStage};
use bolag_core::{EngineConfig, ScrapeError, ScrapeResult, StagingStore};

use crate::checkpoint::CheckpointManager;
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::session::{SessionAttempt, UpstreamSession};
use crate::stages::{control_signal, truncate_error, ControlSignal, JobHandle, StageExit};
use crate::wire::{normalize_page, NextDataResponse, SegmentLimits, SegmentationPage};

/// Expected-pages factor for the count estimate when the upstream omits
/// `numberOfHits`. The estimate is a documented lower bound.
const EXPECTED_PAGES_FACTOR: i64 = 10;

/// Pages sampled beyond the first when estimating.
const PREVIEW_SAMPLE_PAGES: u32 = 4;

/// Preview result for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationPreview {
    pub count: i64,
    pub is_exact: bool,
    pub is_estimated: bool,
    pub actual_profit_limits: Option<SegmentLimits>,
}

pub struct SegmentationStage {
    session: Arc<UpstreamSession>,
    limiter: Arc<AdaptiveRateLimiter>,
    store: StagingStore,
    config: EngineConfig,
}

impl SegmentationStage {
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

    /// Run the stage to completion, pause, or stop.
    pub async fn run(&self, job: &mut Job, handle: &JobHandle) -> ScrapeResult<StageExit> {
        let build_id = self.session.build_id().await?;
        let filters = job.params.clone();

        let mut checkpoint = match self.store.load_checkpoint(job.id, JobStage::Stage1).await? {
            Some(checkpoint) => checkpoint,
            None => Checkpoint::new(job.id, JobStage::Stage1),
        };
        let mut manager = CheckpointManager::new(self.store.clone(), self.config.checkpoint_interval);
        let mut page = checkpoint.last_processed_page.max(job.last_page) as u32 + 1;
        let mut empty_streak: u32 = checkpoint
            .data
            .as_ref()
            .and_then(|d| d.get("emptyStreak"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        info!(job_id = %job.id, start_page = page, "starting segmentation");

        while page <= self.config.max_pages && empty_streak < self.config.max_empty_pages {
            match control_signal(handle, &self.store, job.id).await? {
                ControlSignal::Continue => {}
                ControlSignal::Pause => {
                    self.flush(&mut checkpoint, &mut manager, job, empty_streak).await?;
                    return Ok(StageExit::Paused);
                }
                ControlSignal::Stop => {
                    self.flush(&mut checkpoint, &mut manager, job, empty_streak).await?;
                    return Ok(StageExit::Stopped);
                }
            }

            let batch_end = (page + self.config.batch_size - 1).min(self.config.max_pages);
            let pages: Vec<u32> = (page..=batch_end).collect();
            let results: Vec<(u32, Option<ScrapeResult<SegmentationPage>>)> =
                stream::iter(pages.into_iter().map(|n| {
                    let build_id = build_id.clone();
                    let filters = filters.clone();
                    async move {
                        if handle.is_interrupted() {
                            return (n, None);
                        }
                        let result = self
                            .limiter
                            .execute(|| self.fetch_page(&build_id, &filters, n))
                            .await;
                        (n, Some(result))
                    }
                }))
                .buffered(self.config.chunk_concurrency as usize)
                .collect()
                .await;

            let mut batch_companies = Vec::new();
            for (n, result) in results {
                let Some(result) = result else {
                    // interrupted before dispatch; handled on the next loop
                    break;
                };
                match result {
                    Ok(listing) => {
                        if let Some(hits) = listing.number_of_hits {
                            job.total_companies = hits;
                        }
                        let staged = normalize_page(&listing, job.id);
                        if staged.is_empty() {
                            empty_streak += 1;
                        } else {
                            empty_streak = 0;
                            batch_companies.extend(staged);
                        }
                        job.last_page = n as i64;
                        if empty_streak >= self.config.max_empty_pages {
                            break;
                        }
                    }
                    Err(err) if err.is_fatal_for_job() => {
                        // preserve a resumable checkpoint, then surface
                        self.flush(&mut checkpoint, &mut manager, job, empty_streak).await?;
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(job_id = %job.id, page = n, error = %err, "page fetch failed");
                        job.error_count += 1;
                        job.last_error = Some(truncate_error(&format!("page {}: {}", n, err)));
                    }
                }
            }

            let staged = self.store.upsert_companies(&batch_companies).await?;
            job.processed_count += staged as i64;

            checkpoint.last_processed_page = job.last_page;
            checkpoint.processed_count = job.processed_count;
            checkpoint.error_count = job.error_count;
            checkpoint.last_error = job.last_error.clone();
            checkpoint.data = Some(serde_json::json!({ "emptyStreak": empty_streak }));
            checkpoint.updated_at = chrono::Utc::now();
            manager.record(&checkpoint, staged as u64, false).await;
            self.store.update_job_progress(job).await?;

            page = batch_end + 1;
        }

        self.flush(&mut checkpoint, &mut manager, job, empty_streak).await?;
        info!(
            job_id = %job.id,
            companies = job.processed_count,
            last_page = job.last_page,
            "segmentation finished"
        );
        Ok(StageExit::Completed)
    }

    async fn flush(
        &self,
        checkpoint: &mut Checkpoint,
        manager: &mut CheckpointManager,
        job: &mut Job,
        empty_streak: u32,
    ) -> ScrapeResult<()> {
        checkpoint.last_processed_page = job.last_page;
        checkpoint.processed_count = job.processed_count;
        checkpoint.error_count = job.error_count;
        checkpoint.last_error = job.last_error.clone();
        checkpoint.data = Some(serde_json::json!({ "emptyStreak": empty_streak }));
        checkpoint.updated_at = chrono::Utc::now();
        manager.record(checkpoint, 0, true).await;
        self.store.update_job_progress(job).await
    }

    /// Single-page fetch plus a small sample, returning an exact count when
    /// the upstream reports one and a documented lower-bound estimate
    /// otherwise. Learned profit limits trigger one authoritative refetch
    /// when the operator left the profit band open.
    pub async fn preview(&self, filters: &Filters) -> ScrapeResult<SegmentationPreview> {
        let filters = filters.clone().normalize();
        filters.check_bounds()?;
        let build_id = self.session.build_id().await?;

        let first = match self.first_page(&build_id, &filters).await? {
            SessionAttempt::Done(page) => page,
            SessionAttempt::Empty => {
                return Ok(SegmentationPreview {
                    count: 0,
                    is_exact: true,
                    is_estimated: false,
                    actual_profit_limits: None,
                })
            }
        };

        let learned = first.limits.filter(|l| l.profit_from.is_some() || l.profit_to.is_some());
        if filters.profit_from.is_none() && filters.profit_to.is_none() {
            if let Some(limits) = learned {
                let mut refined = filters.clone();
                refined.profit_from = limits.profit_from;
                refined.profit_to = limits.profit_to;
                let listing = self.fetch_page(&build_id, &refined, 1).await?;
                if let Some(hits) = listing.number_of_hits {
                    return Ok(SegmentationPreview {
                        count: hits,
                        is_exact: true,
                        is_estimated: false,
                        actual_profit_limits: Some(limits),
                    });
                }
            }
        }

        if let Some(hits) = first.number_of_hits {
            return Ok(SegmentationPreview {
                count: hits,
                is_exact: true,
                is_estimated: false,
                actual_profit_limits: learned,
            });
        }

        // No authoritative total: sample a few pages and estimate from the
        // average page fill. Deliberately a lower bound.
        let mut page_sizes = vec![first.companies.len() as i64];
        for n in 2..=(1 + PREVIEW_SAMPLE_PAGES) {
            match self.fetch_page(&build_id, &filters, n).await {
                Ok(listing) if listing.companies.is_empty() => break,
                Ok(listing) => page_sizes.push(listing.companies.len() as i64),
                Err(err) => {
                    warn!(page = n, error = %err, "preview sample fetch failed");
                    break;
                }
            }
        }
        let total: i64 = page_sizes.iter().sum();
        let average = total / page_sizes.len() as i64;
        Ok(SegmentationPreview {
            count: average * EXPECTED_PAGES_FACTOR,
            is_exact: false,
            is_estimated: true,
            actual_profit_limits: learned,
        })
    }

    /// First page through the session wrapper: an empty first page triggers
    /// one session refresh before it is believed.
    async fn first_page(
        &self,
        build_id: &str,
        filters: &Filters,
    ) -> ScrapeResult<SessionAttempt<SegmentationPage>> {
        self.session
            .with_session(|_session| async {
                let listing = self.fetch_page(build_id, filters, 1).await?;
                if listing.companies.is_empty() && listing.number_of_hits.is_none() {
                    Ok(SessionAttempt::Empty)
                } else {
                    Ok(SessionAttempt::Done(listing))
                }
            })
            .await
    }

    async fn fetch_page(
        &self,
        build_id: &str,
        filters: &Filters,
        page: u32,
    ) -> ScrapeResult<SegmentationPage> {
        let url = self.page_url(build_id, filters, page);
        for attempt in 1..=2u32 {
            let session = self.session.current().await?;
            let response = self
                .session
                .gateway()
                .fetch(&url, &session.headers("application/json"))
                .await?;
            if response.status == 403 && attempt == 1 {
                // blocked cookies; the retry must go out with a fresh set
                warn!(page, "403 from listing endpoint, refreshing session");
                self.session.acquire().await?;
                continue;
            }
            let response = response.ensure_success()?;
            match serde_json::from_str::<NextDataResponse<SegmentationPage>>(&response.body) {
                Ok(parsed) => return Ok(parsed.page_props),
                Err(err) if attempt == 1 => {
                    // unexpected shape: once more with a fresh session
                    warn!(page, error = %err, "unexpected listing payload, refreshing session");
                    self.session.acquire().await?;
                }
                Err(err) => return Err(ScrapeError::parse(err.to_string())),
            }
        }
        Err(ScrapeError::parse("listing payload unparseable"))
    }

    fn page_url(&self, build_id: &str, filters: &Filters, page: u32) -> String {
        let mut url = format!(
            "{}/_next/data/{}/segmentation.json?revenueFrom={}&revenueTo={}",
            self.session.base_url(),
            build_id,
            filters.revenue_from,
            filters.revenue_to,
        );
        if let Some(from) = filters.profit_from {
            url.push_str(&format!("&profitFrom={}", from));
        }
        if let Some(to) = filters.profit_to {
            url.push_str(&format!("&profitTo={}", to));
        }
        url.push_str(&format!("&page={}&companyType={}", page, filters.company_type));
        url
    }
}
