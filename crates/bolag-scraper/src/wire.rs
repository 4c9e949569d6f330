//! Canonical wire schema for the upstream Next.js data endpoints.
//!
//! Upstream payloads are loosely typed: numbers arrive as strings with
//! embedded spaces, fields come and go between deploys. Every DTO here is
//! forgiving (all fields optional, unknown fields ignored), and the original
//! report JSON travels into staging untouched as `raw_data`.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use bolag_core::models::{CompanyDetails, CompanyStatus, FinancialRecord, StagingCompany};

/// Envelope of every `/_next/data/...` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextDataResponse<T> {
    pub page_props: T,
}

/// Page props of the segmentation listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmentationPage {
    pub companies: Vec<CompanyDto>,
    /// Exact total; authoritative when present
    pub number_of_hits: Option<i64>,
    pub has_more_pages: Option<bool>,
    /// Upstream default profit bounds, learned on the first page
    pub limits: Option<SegmentLimits>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, serde::Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmentLimits {
    pub profit_from: Option<i64>,
    pub profit_to: Option<i64>,
}

/// One company as listed by segmentation or the JSON search endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompanyDto {
    pub organisation_number: Option<String>,
    pub display_name: Option<String>,
    pub name: Option<String>,
    pub company_id: Option<String>,
    pub home_page: Option<String>,
    pub nace_categories: Vec<String>,
    pub proff_industries: Vec<ProffIndustry>,
    pub revenue: Option<serde_json::Value>,
    pub profit: Option<serde_json::Value>,
    pub foundation_year: Option<serde_json::Value>,
    pub company_accounts_last_updated_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProffIndustry {
    pub name: Option<String>,
}

impl CompanyDto {
    /// Map a listing DTO to a staged company. Rows without an organisation
    /// number are unusable and yield `None` (logged, not fatal).
    pub fn to_staging_company(&self, job_id: Uuid) -> Option<StagingCompany> {
        let orgnr = self
            .organisation_number
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        let now = Utc::now();
        Some(StagingCompany {
            orgnr: orgnr.to_string(),
            company_name: self
                .display_name
                .clone()
                .or_else(|| self.name.clone())
                .unwrap_or_default(),
            company_id: None,
            company_id_hint: self.company_id.clone(),
            homepage: self.home_page.clone(),
            nace_categories: self.nace_categories.clone(),
            segment_name: self
                .proff_industries
                .iter()
                .filter_map(|i| i.name.clone())
                .filter(|n| !n.is_empty())
                .collect(),
            revenue_sek: self.revenue.as_ref().and_then(coerce_int),
            profit_sek: self.profit.as_ref().and_then(coerce_int),
            foundation_year: self.foundation_year.as_ref().and_then(coerce_int),
            accounts_last_year: self.company_accounts_last_updated_date.clone(),
            scraped_at: now,
            job_id,
            status: CompanyStatus::Pending,
            error_message: None,
            updated_at: now,
        })
    }
}

/// Normalize a segmentation page into staged companies, skipping DTOs
/// without an orgnr.
pub fn normalize_page(page: &SegmentationPage, job_id: Uuid) -> Vec<StagingCompany> {
    page.companies
        .iter()
        .filter_map(|dto| {
            let staged = dto.to_staging_company(job_id);
            if staged.is_none() {
                warn!(
                    name = dto.display_name.as_deref().unwrap_or("<unnamed>"),
                    "skipping listed company without organisation number"
                );
            }
            staged
        })
        .collect()
}

/// Page props of the company profile endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompanyProfilePage {
    pub company: Option<CompanyProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompanyProfile {
    pub company_accounts: Vec<AccountReport>,
    pub employees: Option<serde_json::Value>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub legal_name: Option<String>,
    pub domicile: Option<String>,
    pub signatory: Option<String>,
    pub directors: Vec<Director>,
    pub foundation_date: Option<String>,
    pub business_unit_type: Option<String>,
    pub industries: Vec<ProffIndustry>,
    pub certificates: Vec<String>,
    pub external_links: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Director {
    pub name: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountReport {
    pub year: Option<serde_json::Value>,
    pub period: Option<serde_json::Value>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub currency: Option<String>,
    pub accounts: Vec<AccountEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountEntry {
    pub code: Option<String>,
    pub name: Option<String>,
    pub label: Option<String>,
    pub amount: Option<serde_json::Value>,
}

impl AccountReport {
    /// Build the code → kSEK map for this report.
    ///
    /// Code-based entries win. When `EK` is missing, an entry whose name
    /// matches "eget" and "kapital" (case-insensitive) supplies the equity
    /// amount.
    pub fn account_map(&self) -> BTreeMap<String, i64> {
        let mut map = BTreeMap::new();
        for entry in &self.accounts {
            let (Some(code), Some(amount)) = (
                entry.code.as_deref().map(str::trim).filter(|c| !c.is_empty()),
                entry.amount.as_ref().and_then(coerce_int),
            ) else {
                continue;
            };
            map.insert(code.to_string(), amount);
        }
        if !map.contains_key("EK") {
            let equity = self.accounts.iter().find_map(|entry| {
                let label = entry.name.as_deref().or(entry.label.as_deref())?;
                let label = label.to_lowercase();
                if label.contains("eget") && label.contains("kapital") {
                    entry.amount.as_ref().and_then(coerce_int)
                } else {
                    None
                }
            });
            if let Some(amount) = equity {
                map.insert("EK".to_string(), amount);
            }
        }
        map
    }

    /// Parse one report into a staged record. Reports without a usable year
    /// yield `None`.
    pub fn to_record(
        &self,
        job_id: Uuid,
        company_id: &str,
        orgnr: &str,
    ) -> Option<FinancialRecord> {
        let year = self.year.as_ref().and_then(coerce_int)? as i32;
        let period = self
            .period
            .as_ref()
            .and_then(coerce_string)
            .unwrap_or_else(|| "12".to_string());
        let raw_data = serde_json::json!({
            "year": self.year,
            "period": self.period,
            "periodStart": self.period_start,
            "periodEnd": self.period_end,
            "currency": self.currency,
            "accounts": self
                .accounts
                .iter()
                .map(|a| serde_json::json!({
                    "code": a.code,
                    "name": a.name,
                    "label": a.label,
                    "amount": a.amount,
                }))
                .collect::<Vec<_>>(),
        });
        Some(FinancialRecord::from_accounts(
            job_id,
            company_id,
            orgnr,
            year,
            &period,
            self.period_start.as_deref().and_then(parse_iso_date),
            self.period_end.as_deref().and_then(parse_iso_date),
            self.currency.clone(),
            self.account_map(),
            raw_data,
        ))
    }
}

impl CompanyProfile {
    /// Extract the metadata block stored alongside the financials.
    pub fn to_details(&self, job_id: Uuid, orgnr: &str) -> CompanyDetails {
        CompanyDetails {
            orgnr: orgnr.to_string(),
            job_id,
            employees: self.employees.as_ref().and_then(coerce_int),
            description: self.description.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
            legal_name: self.legal_name.clone(),
            domicile: self.domicile.clone(),
            signatory: self.signatory.clone(),
            directors: self
                .directors
                .iter()
                .filter_map(|d| d.name.clone())
                .collect(),
            foundation_date: self.foundation_date.clone(),
            business_unit_type: self.business_unit_type.clone(),
            industries: self
                .industries
                .iter()
                .filter_map(|i| i.name.clone())
                .collect(),
            certificates: self.certificates.clone(),
            external_links: self.external_links.clone(),
        }
    }
}

/// Coerce an upstream JSON scalar to an integer kSEK amount. Strings may
/// carry grouping spaces ("44 212"); non-finite floats map to `None`.
pub fn coerce_int(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                let f = n.as_f64()?;
                f.is_finite().then(|| f.round() as i64)
            }
        }
        serde_json::Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            let f: f64 = cleaned.parse().ok()?;
            f.is_finite().then(|| f.round() as i64)
        }
        _ => None,
    }
}

fn coerce_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
