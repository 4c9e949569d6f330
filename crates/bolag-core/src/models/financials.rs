use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named account codes of the Swedish statutory report as published by the
/// upstream listing. Every code is a nullable kSEK amount on a
/// `FinancialRecord`; unknown codes coming off the wire stay in `raw_data`.
pub const ACCOUNT_CODES: &[&str] = &[
    "SDI", "DR", "ORS", "RG", "EK", "FK", "ADI", "ADK", "ADR", "AK", "ANT", "FI", "GG", "KBP",
    "LG", "SAP", "SED", "SI", "SEK", "SF", "SFA", "SGE", "SIA", "SIK", "SKG", "SKGKI", "SKO",
    "SLG", "SOM", "SUB", "SV", "SVD", "UTR", "FSD", "KB", "AWA", "IAC", "MIN", "BE", "TR",
];

/// Whether `code` is part of the staged projection.
pub fn is_known_account_code(code: &str) -> bool {
    ACCOUNT_CODES.contains(&code)
}

/// **Financial Record Model**
///
/// One staged annual report for a company: the projection of all named
/// account codes plus the untouched upstream JSON. Keyed by
/// (companyId, year, period); writes are upserts, so re-fetching a report is
/// idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialRecord {
    /// Opaque upstream company identifier
    pub company_id: String,

    /// Organisation number, denormalized for lookups
    pub orgnr: String,

    pub year: i32,

    /// Report period, e.g. "12" for a full calendar year
    pub period: String,

    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,

    /// Report currency; upstream reports in SEK
    pub currency: String,

    /// Projection of the named account codes, kSEK. Codes the report did not
    /// carry are absent.
    pub accounts: BTreeMap<String, i64>,

    /// Mirror of SDI (net revenue)
    pub revenue: Option<i64>,

    /// Mirror of DR (net profit)
    pub profit: Option<i64>,

    /// Mirror of ANT (employee count)
    pub employees: Option<i64>,

    /// Mirror of BE
    pub be: Option<i64>,

    /// Mirror of TR
    pub tr: Option<i64>,

    /// Untouched upstream report JSON
    pub raw_data: serde_json::Value,

    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    pub validation_warnings: Vec<String>,

    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinancialRecord {
    /// Build a record from a parsed account map. Only known codes enter the
    /// projection; the mirrors are derived here so they can never drift from
    /// the map.
    #[allow(clippy::too_many_arguments)]
    pub fn from_accounts(
        job_id: Uuid,
        company_id: &str,
        orgnr: &str,
        year: i32,
        period: &str,
        period_start: Option<NaiveDate>,
        period_end: Option<NaiveDate>,
        currency: Option<String>,
        accounts: BTreeMap<String, i64>,
        raw_data: serde_json::Value,
    ) -> Self {
        let accounts: BTreeMap<String, i64> = accounts
            .into_iter()
            .filter(|(code, _)| is_known_account_code(code))
            .collect();
        let now = Utc::now();
        Self {
            company_id: company_id.to_string(),
            orgnr: orgnr.to_string(),
            year,
            period: period.to_string(),
            period_start,
            period_end,
            currency: currency.unwrap_or_else(|| "SEK".to_string()),
            revenue: accounts.get("SDI").copied(),
            profit: accounts.get("DR").copied(),
            employees: accounts.get("ANT").copied(),
            be: accounts.get("BE").copied(),
            tr: accounts.get("TR").copied(),
            accounts,
            raw_data,
            validation_status: ValidationStatus::Pending,
            validation_errors: Vec::new(),
            validation_warnings: Vec::new(),
            job_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount for a named account code, if the report carried it.
    pub fn amount(&self, code: &str) -> Option<i64> {
        self.accounts.get(code).copied()
    }
}

/// Validation outcome for a staged financial record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Valid,
    Warning,
    Invalid,
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationStatus::Pending => write!(f, "pending"),
            ValidationStatus::Valid => write!(f, "valid"),
            ValidationStatus::Warning => write!(f, "warning"),
            ValidationStatus::Invalid => write!(f, "invalid"),
        }
    }
}

impl From<String> for ValidationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "valid" => ValidationStatus::Valid,
            "warning" => ValidationStatus::Warning,
            "invalid" => ValidationStatus::Invalid,
            _ => ValidationStatus::Pending,
        }
    }
}

impl Default for ValidationStatus {
    fn default() -> Self {
        ValidationStatus::Pending
    }
}

/// **Company Details Model**
///
/// Metadata extracted from the stage-3 company profile response and stored
/// alongside the financials for later surfacing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyDetails {
    pub orgnr: String,
    pub job_id: Uuid,
    pub employees: Option<i64>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub legal_name: Option<String>,
    pub domicile: Option<String>,
    pub signatory: Option<String>,
    pub directors: Vec<String>,
    pub foundation_date: Option<String>,
    pub business_unit_type: Option<String>,
    pub industries: Vec<String>,
    pub certificates: Vec<String>,
    pub external_links: Vec<String>,
}
