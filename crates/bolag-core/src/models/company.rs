use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// **Staging Company Model**
///
/// One company row per (job, orgnr), written by stage 1 and enriched by the
/// later stages. The per-stage status advances monotonically
/// (`pending` → `id_resolved` → `financials_fetched`) except for transitions
/// into `error`, which are allowed from any state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingCompany {
    /// Swedish organisation number, canonical trimmed string (10-12 digits)
    pub orgnr: String,

    /// Display name from the segmentation listing
    pub company_name: String,

    /// Opaque upstream identifier, resolved in stage 2
    pub company_id: Option<String>,

    /// companyId as it appeared in the stage-1 listing, when present
    pub company_id_hint: Option<String>,

    /// Homepage URL when the listing carries one
    pub homepage: Option<String>,

    /// NACE category strings, verbatim from upstream
    pub nace_categories: Vec<String>,

    /// Ordered industry segment names
    pub segment_name: Vec<String>,

    /// Latest reported revenue in kSEK
    pub revenue_sek: Option<i64>,

    /// Latest reported net profit in kSEK
    pub profit_sek: Option<i64>,

    pub foundation_year: Option<i64>,

    /// Date the upstream accounts were last updated
    pub accounts_last_year: Option<String>,

    pub scraped_at: DateTime<Utc>,

    /// Owning job
    pub job_id: Uuid,

    pub status: CompanyStatus,

    /// Failure detail when status is `error`
    pub error_message: Option<String>,

    pub updated_at: DateTime<Utc>,
}

/// Per-company pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStatus {
    Pending,
    IdResolved,
    FinancialsFetched,
    Error,
}

impl CompanyStatus {
    /// Rank used to enforce monotonic advancement; `error` is reachable from
    /// anywhere and never ranked.
    fn rank(self) -> Option<u8> {
        match self {
            CompanyStatus::Pending => Some(0),
            CompanyStatus::IdResolved => Some(1),
            CompanyStatus::FinancialsFetched => Some(2),
            CompanyStatus::Error => None,
        }
    }

    /// Forward or same-state writes pass (same-state keeps re-staging
    /// idempotent); regressions do not.
    pub fn can_advance_to(self, to: CompanyStatus) -> bool {
        match (self.rank(), to.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to >= from,
            (None, Some(_)) => false,
        }
    }
}

impl std::fmt::Display for CompanyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompanyStatus::Pending => write!(f, "pending"),
            CompanyStatus::IdResolved => write!(f, "id_resolved"),
            CompanyStatus::FinancialsFetched => write!(f, "financials_fetched"),
            CompanyStatus::Error => write!(f, "error"),
        }
    }
}

impl From<String> for CompanyStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "id_resolved" => CompanyStatus::IdResolved,
            "financials_fetched" => CompanyStatus::FinancialsFetched,
            "error" => CompanyStatus::Error,
            _ => CompanyStatus::Pending,
        }
    }
}

/// **Company-ID Mapping Model**
///
/// Stage-2 resolution result for one orgnr within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyIdMapping {
    pub job_id: Uuid,
    pub orgnr: String,
    pub company_id: String,

    /// Which search endpoint produced the hit
    pub source: String,

    /// Resolution confidence in [0, 1]; 1.0 for HTML hits matched by orgnr
    pub confidence_score: f64,

    pub status: MappingStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Pending,
    Resolved,
    Error,
}

impl std::fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingStatus::Pending => write!(f, "pending"),
            MappingStatus::Resolved => write!(f, "resolved"),
            MappingStatus::Error => write!(f, "error"),
        }
    }
}

impl From<String> for MappingStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "resolved" => MappingStatus::Resolved,
            "error" => MappingStatus::Error,
            _ => MappingStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_advances_monotonically() {
        use CompanyStatus::*;
        assert!(Pending.can_advance_to(IdResolved));
        assert!(Pending.can_advance_to(FinancialsFetched));
        assert!(IdResolved.can_advance_to(FinancialsFetched));
        assert!(FinancialsFetched.can_advance_to(FinancialsFetched));
        assert!(!IdResolved.can_advance_to(Pending));
        assert!(!FinancialsFetched.can_advance_to(IdResolved));
    }

    #[test]
    fn test_error_reachable_from_any_state() {
        use CompanyStatus::*;
        assert!(Pending.can_advance_to(Error));
        assert!(IdResolved.can_advance_to(Error));
        assert!(FinancialsFetched.can_advance_to(Error));
        // but never back out of error
        assert!(!Error.can_advance_to(Pending));
        assert!(!Error.can_advance_to(FinancialsFetched));
    }
}
