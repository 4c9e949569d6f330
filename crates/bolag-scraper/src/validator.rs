//! **Validator**
//!
//! Rule-based validation over staged financial records. The rule set is
//! ordered and cumulative; the final status is the worst of all rule
//! outputs. Validation never throws: verdicts are recorded on the rows.

use chrono::{Datelike, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use bolag_core::models::{FinancialRecord, ValidationStatus};
use bolag_core::{ScrapeResult, StagingStore};

const BILLION_KSEK: i64 = 1_000_000_000;

/// Outcome of validating one record.
#[derive(Debug, Clone)]
pub struct Validation {
    pub status: ValidationStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Per-job validation summary for the control surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub validated: u64,
    pub valid: u64,
    pub warnings: u64,
    pub invalid: u64,
}

/// Validate a single record. Pure: same record, same verdict.
pub fn validate(record: &FinancialRecord) -> Validation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if record.company_id.trim().is_empty() {
        errors.push("companyId is missing".to_string());
    }
    if record.orgnr.trim().is_empty() {
        errors.push("orgnr is missing".to_string());
    }
    if record.period.trim().is_empty() {
        errors.push("period is missing".to_string());
    }

    let current_year = Utc::now().year();
    if record.year < 2000 || record.year > current_year + 1 {
        errors.push(format!("year {} is out of range", record.year));
    } else if record.year < 2010 {
        warnings.push(format!("year {} predates reliable filings", record.year));
    }

    let sdi = record.amount("SDI");
    if let Some(sdi) = sdi {
        if sdi < 0 {
            errors.push(format!("revenue (SDI) is negative: {}", sdi));
        } else if sdi == 0 {
            warnings.push("revenue (SDI) is zero".to_string());
        } else if sdi > BILLION_KSEK {
            warnings.push(format!("revenue (SDI) is implausibly large: {}", sdi));
        }
    }

    let dr = record.amount("DR");
    if let Some(dr) = dr {
        if dr > BILLION_KSEK {
            warnings.push(format!("profit (DR) is implausibly large: {}", dr));
        }
    }

    let ors = record.amount("ORS");
    if let Some(ors) = ors {
        if ors > BILLION_KSEK {
            warnings.push(format!("EBITDA (ORS) is implausibly large: {}", ors));
        }
    }

    let ek = record.amount("EK");
    if let Some(ek) = ek {
        if !(-BILLION_KSEK..=BILLION_KSEK).contains(&ek) {
            warnings.push(format!("equity (EK) is out of plausible range: {}", ek));
        }
    }

    if sdi.unwrap_or(0) == 0 && dr.unwrap_or(0) == 0 && ors.unwrap_or(0) == 0 && ek.unwrap_or(0) == 0
    {
        warnings.push("all key figures are zero; report looks incomplete".to_string());
    }

    if let (Some(sdi), Some(dr)) = (sdi, dr) {
        if sdi > 0 && (dr as f64 / sdi as f64) > 0.5 {
            warnings.push(format!(
                "profit margin above 50% ({} / {}); verify the report",
                dr, sdi
            ));
        }
    }

    if record.currency != "SEK" {
        warnings.push(format!("unexpected currency {}", record.currency));
    }

    let status = if !errors.is_empty() {
        ValidationStatus::Invalid
    } else if !warnings.is_empty() {
        ValidationStatus::Warning
    } else {
        ValidationStatus::Valid
    };

    Validation {
        status,
        errors,
        warnings,
    }
}

/// Validate every staged record of a job and persist the verdicts.
pub async fn validate_job(store: &StagingStore, job_id: Uuid) -> ScrapeResult<ValidationSummary> {
    let records = store.financials_for_job(job_id).await?;
    let mut summary = ValidationSummary::default();
    for record in &records {
        let verdict = validate(record);
        store
            .set_validation(
                &record.company_id,
                record.year,
                &record.period,
                verdict.status,
                &verdict.errors,
                &verdict.warnings,
            )
            .await?;
        summary.validated += 1;
        match verdict.status {
            ValidationStatus::Valid => summary.valid += 1,
            ValidationStatus::Warning => summary.warnings += 1,
            ValidationStatus::Invalid => summary.invalid += 1,
            ValidationStatus::Pending => {}
        }
    }
    info!(
        %job_id,
        validated = summary.validated,
        valid = summary.valid,
        warnings = summary.warnings,
        invalid = summary.invalid,
        "validation finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record_with(year: i32, accounts: &[(&str, i64)]) -> FinancialRecord {
        let map: BTreeMap<String, i64> = accounts
            .iter()
            .map(|(code, amount)| (code.to_string(), *amount))
            .collect();
        FinancialRecord::from_accounts(
            Uuid::new_v4(),
            "AB12CD34EF56G",
            "5561234567",
            year,
            "12",
            None,
            None,
            Some("SEK".to_string()),
            map,
            serde_json::json!({}),
        )
    }

    fn assert_invariants(validation: &Validation) {
        match validation.status {
            ValidationStatus::Invalid => assert!(!validation.errors.is_empty()),
            ValidationStatus::Warning => {
                assert!(validation.errors.is_empty());
                assert!(!validation.warnings.is_empty());
            }
            ValidationStatus::Valid => {
                assert!(validation.errors.is_empty());
                assert!(validation.warnings.is_empty());
            }
            ValidationStatus::Pending => panic!("validator never returns pending"),
        }
    }

    #[test]
    fn test_healthy_record_is_valid() {
        let record = record_with(2024, &[("SDI", 44_212), ("DR", 5_100), ("EK", 5_666)]);
        let validation = validate(&record);
        assert_eq!(validation.status, ValidationStatus::Valid);
        assert_invariants(&validation);
    }

    #[test]
    fn test_missing_company_id_is_invalid() {
        let mut record = record_with(2024, &[("SDI", 100)]);
        record.company_id = String::new();
        let validation = validate(&record);
        assert_eq!(validation.status, ValidationStatus::Invalid);
        assert_invariants(&validation);
    }

    #[test]
    fn test_year_bounds() {
        let validation = validate(&record_with(1999, &[("SDI", 100), ("DR", 10)]));
        assert_eq!(validation.status, ValidationStatus::Invalid);

        let future = Utc::now().year() + 2;
        let validation = validate(&record_with(future, &[("SDI", 100), ("DR", 10)]));
        assert_eq!(validation.status, ValidationStatus::Invalid);

        let validation = validate(&record_with(2005, &[("SDI", 100), ("DR", 10)]));
        assert_eq!(validation.status, ValidationStatus::Warning);
        assert!(validation.warnings[0].contains("2005"));
        assert_invariants(&validation);
    }

    #[test]
    fn test_negative_revenue_is_invalid() {
        let validation = validate(&record_with(2024, &[("SDI", -5), ("DR", 1)]));
        assert_eq!(validation.status, ValidationStatus::Invalid);
    }

    #[test]
    fn test_zero_revenue_warns() {
        let validation = validate(&record_with(2024, &[("SDI", 0), ("DR", 10)]));
        assert_eq!(validation.status, ValidationStatus::Warning);
        assert_invariants(&validation);
    }

    #[test]
    fn test_implausible_magnitudes_warn() {
        for code in ["SDI", "DR", "ORS"] {
            let validation = validate(&record_with(2024, &[(code, 2 * BILLION_KSEK), ("EK", 1)]));
            assert_eq!(validation.status, ValidationStatus::Warning, "code {}", code);
        }
        let validation = validate(&record_with(2024, &[("EK", -2 * BILLION_KSEK), ("SDI", 100)]));
        assert_eq!(validation.status, ValidationStatus::Warning);
    }

    #[test]
    fn test_all_zero_figures_warn_incomplete() {
        let validation = validate(&record_with(2024, &[]));
        assert_eq!(validation.status, ValidationStatus::Warning);
        assert!(validation
            .warnings
            .iter()
            .any(|w| w.contains("incomplete")));
    }

    #[test]
    fn test_margin_above_half_warns() {
        let validation = validate(&record_with(2024, &[("SDI", 100), ("DR", 51), ("EK", 1)]));
        assert_eq!(validation.status, ValidationStatus::Warning);
        assert!(validation.warnings.iter().any(|w| w.contains("margin")));

        let validation = validate(&record_with(2024, &[("SDI", 100), ("DR", 50), ("EK", 1)]));
        assert_eq!(validation.status, ValidationStatus::Valid);
    }

    #[test]
    fn test_foreign_currency_warns() {
        let mut record = record_with(2024, &[("SDI", 100), ("DR", 10)]);
        record.currency = "EUR".to_string();
        let validation = validate(&record);
        assert_eq!(validation.status, ValidationStatus::Warning);
    }

    #[test]
    fn test_determinism() {
        let record = record_with(2024, &[("SDI", 100), ("DR", 80)]);
        let first = validate(&record);
        let second = validate(&record);
        assert_eq!(first.status, second.status);
        assert_eq!(first.warnings, second.warnings);
        assert_eq!(first.errors, second.errors);
    }

    #[tokio::test]
    async fn test_validate_job_persists_verdicts() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = Uuid::new_v4();
        let mut bad = record_with(1999, &[("SDI", 100)]);
        bad.job_id = job_id;
        bad.company_id = "BAD0000000000".to_string();
        let mut good = record_with(2024, &[("SDI", 100), ("DR", 10), ("EK", 5)]);
        good.job_id = job_id;
        store.upsert_financials(&[bad, good]).await.unwrap();

        let summary = validate_job(&store, job_id).await.unwrap();
        assert_eq!(summary.validated, 2);
        assert_eq!(summary.valid, 1);
        assert_eq!(summary.invalid, 1);

        let eligible = store.financials_for_migration(job_id, false).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].company_id, "AB12CD34EF56G");
    }
}
