use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::Validate;

use crate::error::{ScrapeError, ScrapeResult};

/// **Scrape Job Model**
///
/// A job drives one run of the pipeline for a single filter selection. It is
/// created by the job controller, mutated only by the job controller, and
/// retained for audit (the engine never deletes job rows).
///
/// # Lifecycle
/// - `pending` → `running` on start
/// - `running` → `paused` / `stopped` / `error` / `done`
/// - `paused` and `error` can re-enter `running` via resume
/// - `stopped` and `done` are terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job
    pub id: Uuid,

    /// What the job runs: one stage or the full pipeline
    pub job_type: JobType,

    /// SHA-256 fingerprint of the normalized filter JSON
    pub filter_hash: String,

    /// The (normalized) filter selection the job was started with
    pub params: Filters,

    /// Current lifecycle status
    pub status: JobStatus,

    /// Stage the job is currently in (advances only between stages)
    pub stage: JobStage,

    /// Last segmentation page fully processed
    pub last_page: i64,

    /// Companies processed in the current stage
    pub processed_count: i64,

    /// Total companies known for the job (authoritative once stage 1 saw
    /// `numberOfHits`)
    pub total_companies: i64,

    /// Per-company failures accumulated so far
    pub error_count: i64,

    /// Most recent job-level failure message (capped, per-company detail is
    /// on the staging rows)
    pub last_error: Option<String>,

    /// Opaque rate-limiter snapshot persisted at checkpoint time
    pub rate_limit_stats: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a fresh pending job for a normalized filter selection.
    pub fn new(job_type: JobType, filters: Filters) -> ScrapeResult<Self> {
        let filters = filters.normalize();
        filters.check_bounds()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            job_type,
            filter_hash: filters.fingerprint(),
            params: filters,
            status: JobStatus::Pending,
            stage: JobStage::Stage1,
            last_page: 0,
            processed_count: 0,
            total_companies: 0,
            error_count: 0,
            last_error: None,
            rate_limit_stats: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Job type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Segmentation,
    IdResolution,
    Financials,
    FullPipeline,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Segmentation => write!(f, "segmentation"),
            JobType::IdResolution => write!(f, "id_resolution"),
            JobType::Financials => write!(f, "financials"),
            JobType::FullPipeline => write!(f, "full_pipeline"),
        }
    }
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "id_resolution" => JobType::IdResolution,
            "financials" => JobType::Financials,
            "full_pipeline" => JobType::FullPipeline,
            _ => JobType::Segmentation,
        }
    }
}

/// Job status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Done,
    Error,
}

impl JobStatus {
    /// Whether the status machine admits a transition to `to`.
    ///
    /// `stopped` and `done` are terminal; `error` is re-enterable after an
    /// operator fix.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Pending, Running) => true,
            (Running, Paused | Stopped | Done | Error) => true,
            (Paused, Running | Stopped) => true,
            (Error, Running) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Done)
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "stopped" => JobStatus::Stopped,
            "done" => JobStatus::Done,
            "error" => JobStatus::Error,
            _ => JobStatus::Pending,
        }
    }
}

/// Pipeline stage enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Stage1,
    Stage2,
    Stage3,
    Validate,
    Migrate,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStage::Stage1 => write!(f, "stage1"),
            JobStage::Stage2 => write!(f, "stage2"),
            JobStage::Stage3 => write!(f, "stage3"),
            JobStage::Validate => write!(f, "validate"),
            JobStage::Migrate => write!(f, "migrate"),
        }
    }
}

impl From<String> for JobStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "stage2" => JobStage::Stage2,
            "stage3" => JobStage::Stage3,
            "validate" => JobStage::Validate,
            "migrate" => JobStage::Migrate,
            _ => JobStage::Stage1,
        }
    }
}

/// **Segmentation Filters**
///
/// Revenue and profit bands in kSEK once normalized. Operators enter mSEK;
/// `normalize()` scales by 1000 exactly once (repeated calls are no-ops, so
/// a filter read back from the store is safe to pass through again).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Filters {
    /// Lower revenue bound (inclusive)
    #[validate(range(min = 0))]
    pub revenue_from: i64,

    /// Upper revenue bound (inclusive)
    #[validate(range(min = 0))]
    pub revenue_to: i64,

    /// Lower profit bound; when absent the upstream default limits apply and
    /// are learned from the first response
    pub profit_from: Option<i64>,

    /// Upper profit bound
    pub profit_to: Option<i64>,

    /// Corporate form; only "AB" is scraped
    pub company_type: String,

    #[serde(default)]
    normalized: bool,
}

impl Filters {
    /// Build a filter selection from operator input in mSEK.
    pub fn from_msek(
        revenue_from: i64,
        revenue_to: i64,
        profit_from: Option<i64>,
        profit_to: Option<i64>,
    ) -> Self {
        Self {
            revenue_from,
            revenue_to,
            profit_from,
            profit_to,
            company_type: "AB".to_string(),
            normalized: false,
        }
    }

    /// Scale mSEK input to kSEK. Idempotent.
    pub fn normalize(mut self) -> Self {
        if !self.normalized {
            self.revenue_from *= 1000;
            self.revenue_to *= 1000;
            self.profit_from = self.profit_from.map(|v| v * 1000);
            self.profit_to = self.profit_to.map(|v| v * 1000);
            self.normalized = true;
        }
        self
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    /// Validate the band bounds. Invalid bounds are a configuration error.
    pub fn check_bounds(&self) -> ScrapeResult<()> {
        if self.revenue_from < 0 || self.revenue_to < 0 {
            return Err(ScrapeError::configuration(
                "revenue bounds must be non-negative",
            ));
        }
        if self.revenue_from > self.revenue_to {
            return Err(ScrapeError::configuration(format!(
                "revenueFrom {} exceeds revenueTo {}",
                self.revenue_from, self.revenue_to
            )));
        }
        if let (Some(from), Some(to)) = (self.profit_from, self.profit_to) {
            if from > to {
                return Err(ScrapeError::configuration(format!(
                    "profitFrom {} exceeds profitTo {}",
                    from, to
                )));
            }
        }
        if self.company_type != "AB" {
            return Err(ScrapeError::configuration(format!(
                "unsupported company type: {}",
                self.company_type
            )));
        }
        Ok(())
    }

    /// Deterministic SHA-256 fingerprint over the sorted-key JSON of the
    /// normalized filter values.
    pub fn fingerprint(&self) -> String {
        let normalized = self.clone().normalize();
        // BTreeMap gives stable key order regardless of struct layout.
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("companyType", serde_json::json!(normalized.company_type));
        fields.insert("revenueFrom", serde_json::json!(normalized.revenue_from));
        fields.insert("revenueTo", serde_json::json!(normalized.revenue_to));
        if let Some(v) = normalized.profit_from {
            fields.insert("profitFrom", serde_json::json!(v));
        }
        if let Some(v) = normalized.profit_to {
            fields.insert("profitTo", serde_json::json!(v));
        }
        let canonical = serde_json::to_string(&fields).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}
