//! **Stage 2 — Company-ID Resolution**
//!
//! Every staged company without an opaque upstream `companyId` gets one,
//! resolved by name search. The HTML industry search is tried first (its
//! hits are matched back to the orgnr by proximity in the markup, confidence
//! 1.0); the JSON search endpoints follow as fallbacks with lower
//! confidence. Companies are processed in staging insertion order.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use bolag_core::models::{
    Checkpoint, CompanyIdMapping, CompanyStatus, Job, JobStage, MappingStatus, StagingCompany,
};
use bolag_core::{EngineConfig, ScrapeError, ScrapeResult, StagingStore};

use crate::checkpoint::CheckpointManager;
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::session::UpstreamSession;
use crate::stages::{control_signal, truncate_error, ControlSignal, JobHandle, StageExit};
use crate::wire::{CompanyDto, NextDataResponse};

/// Candidate company links in the search result markup, e.g.
/// `href="/foretag/alpha-ab/stockholm/AB12CD34EF56G"`.
static FORETAG_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"href="/foretag/[^"]*/([0-9A-Za-z]{13})""#).expect("foretag href regex")
});

/// How far (in bytes of markup) an orgnr may sit from a candidate link and
/// still be considered the same result card.
const PROXIMITY_WINDOW: usize = 3000;

const HTML_CONFIDENCE: f64 = 1.0;
const JSON_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SearchPage {
    companies: Vec<CompanyDto>,
}

pub struct IdResolutionStage {
    session: Arc<UpstreamSession>,
    limiter: Arc<AdaptiveRateLimiter>,
    store: StagingStore,
    config: EngineConfig,
}

impl IdResolutionStage {
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
        let pending = self
            .store
            .companies_by_status(job.id, CompanyStatus::Pending)
            .await?;
        info!(job_id = %job.id, companies = pending.len(), "starting id resolution");

        let mut checkpoint = match self.store.load_checkpoint(job.id, JobStage::Stage2).await? {
            Some(checkpoint) => checkpoint,
            None => Checkpoint::new(job.id, JobStage::Stage2),
        };
        let mut manager = CheckpointManager::new(self.store.clone(), self.config.checkpoint_interval);

        for company in &pending {
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

            let resolution = self
                .limiter
                .execute(|| self.resolve(&build_id, company))
                .await;

            let now = Utc::now();
            let mapping = match resolution {
                Ok(Some((company_id, source, confidence))) => CompanyIdMapping {
                    job_id: job.id,
                    orgnr: company.orgnr.clone(),
                    company_id,
                    source,
                    confidence_score: confidence,
                    status: MappingStatus::Resolved,
                    error_message: None,
                    created_at: now,
                    updated_at: now,
                },
                Ok(None) => {
                    job.error_count += 1;
                    job.last_error = Some(truncate_error(&format!(
                        "{}: companyId not found in any search endpoint",
                        company.orgnr
                    )));
                    CompanyIdMapping {
                        job_id: job.id,
                        orgnr: company.orgnr.clone(),
                        company_id: String::new(),
                        source: "search".to_string(),
                        confidence_score: 0.0,
                        status: MappingStatus::Error,
                        error_message: Some("companyId not found in any search endpoint".to_string()),
                        created_at: now,
                        updated_at: now,
                    }
                }
                Err(err) if err.is_fatal_for_job() => {
                    self.flush(&mut checkpoint, &mut manager, job).await?;
                    return Err(err);
                }
                Err(err) => {
                    warn!(orgnr = %company.orgnr, error = %err, "id resolution failed");
                    job.error_count += 1;
                    job.last_error =
                        Some(truncate_error(&format!("{}: {}", company.orgnr, err)));
                    CompanyIdMapping {
                        job_id: job.id,
                        orgnr: company.orgnr.clone(),
                        company_id: String::new(),
                        source: "search".to_string(),
                        confidence_score: 0.0,
                        status: MappingStatus::Error,
                        error_message: Some(truncate_error(&err.to_string())),
                        created_at: now,
                        updated_at: now,
                    }
                }
            };
            self.store.record_resolution(&mapping).await?;
            job.processed_count += 1;

            checkpoint.processed_count += 1;
            checkpoint.error_count = job.error_count;
            checkpoint.last_processed_company = Some(company.orgnr.clone());
            checkpoint.updated_at = Utc::now();
            manager.record(&checkpoint, 1, false).await;
        }

        self.flush(&mut checkpoint, &mut manager, job).await?;
        info!(job_id = %job.id, "id resolution finished");
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

    /// Walk the search chain; the first URL yielding a candidate whose
    /// organisation number equals the target wins.
    async fn resolve(
        &self,
        build_id: &str,
        company: &StagingCompany,
    ) -> ScrapeResult<Option<(String, String, f64)>> {
        let query = urlencoding::encode(&company.company_name).into_owned();

        match self.resolve_html(&query, &company.orgnr).await {
            Ok(Some(company_id)) => {
                return Ok(Some((company_id, "bransch-sok".to_string(), HTML_CONFIDENCE)))
            }
            Ok(None) => {}
            Err(err) if err.is_fatal_for_job() => return Err(err),
            Err(err) => debug!(orgnr = %company.orgnr, error = %err, "html search failed"),
        }

        for endpoint in ["bransch-sok.json", "search.json", "sok.json"] {
            match self
                .resolve_json(build_id, endpoint, &query, &company.orgnr)
                .await
            {
                Ok(Some(company_id)) => {
                    return Ok(Some((company_id, endpoint.to_string(), JSON_CONFIDENCE)))
                }
                Ok(None) => {}
                Err(err) if err.is_fatal_for_job() => return Err(err),
                Err(err) => debug!(orgnr = %company.orgnr, endpoint, error = %err, "json search failed"),
            }
        }
        Ok(None)
    }

    /// HTML search page: scrape `/foretag/...` hrefs and pick the candidate
    /// closest to an occurrence of the orgnr in the markup.
    async fn resolve_html(&self, query: &str, orgnr: &str) -> ScrapeResult<Option<String>> {
        let session = self.session.current().await?;
        let url = format!("{}/bransch-sok?q={}", self.session.base_url(), query);
        let response = self
            .session
            .gateway()
            .fetch(&url, &session.headers("text/html"))
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = response.ensure_success()?;
        Ok(match_candidate_by_proximity(&response.body, orgnr))
    }

    async fn resolve_json(
        &self,
        build_id: &str,
        endpoint: &str,
        query: &str,
        orgnr: &str,
    ) -> ScrapeResult<Option<String>> {
        let session = self.session.current().await?;
        let url = format!(
            "{}/_next/data/{}/{}?q={}",
            self.session.base_url(),
            build_id,
            endpoint,
            query
        );
        let response = self
            .session
            .gateway()
            .fetch(&url, &session.headers("application/json"))
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = response.ensure_success()?;
        let parsed: NextDataResponse<SearchPage> = serde_json::from_str(&response.body)
            .map_err(|err| ScrapeError::parse(err.to_string()))?;
        Ok(parsed.page_props.companies.iter().find_map(|candidate| {
            let matches = candidate
                .organisation_number
                .as_deref()
                .map(str::trim)
                .is_some_and(|candidate_orgnr| candidate_orgnr == orgnr);
            if matches {
                candidate.company_id.clone()
            } else {
                None
            }
        }))
    }
}

/// Candidate company ids in the markup, matched back to the target orgnr by
/// byte proximity. The orgnr is looked for both plain and hyphenated
/// ("556123-4567").
fn match_candidate_by_proximity(html: &str, orgnr: &str) -> Option<String> {
    let mut orgnr_positions: Vec<usize> = html.match_indices(orgnr).map(|(i, _)| i).collect();
    if orgnr.len() == 10 {
        let hyphenated = format!("{}-{}", &orgnr[..6], &orgnr[6..]);
        orgnr_positions.extend(html.match_indices(&hyphenated).map(|(i, _)| i));
    }
    if orgnr_positions.is_empty() {
        return None;
    }

    let mut best: Option<(usize, String)> = None;
    for captures in FORETAG_HREF.captures_iter(html) {
        let m = captures.get(1).expect("capture group");
        let candidate_pos = m.start();
        let distance = orgnr_positions
            .iter()
            .map(|p| candidate_pos.abs_diff(*p))
            .min()
            .expect("non-empty positions");
        if distance <= PROXIMITY_WINDOW && best.as_ref().map_or(true, |(d, _)| distance < *d) {
            best = Some((distance, m.as_str().to_string()));
        }
    }
    best.map(|(_, company_id)| company_id)
}
