//! Staged financial records and migration-run bookkeeping.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{FinancialRecord, ValidationStatus};

use super::{MigrationRun, StagingStore};

const RECORD_COLUMNS: &str = "company_id, year, period, orgnr, period_start, period_end,
    currency, accounts, revenue, profit, employees, be, tr, raw_data, validation_status,
    validation_errors, validation_warnings, job_id, created_at, updated_at";

impl StagingStore {
    /// Upsert a batch of financial records in one transaction, keyed by
    /// (companyId, year, period).
    pub async fn upsert_financials(&self, records: &[FinancialRecord]) -> ScrapeResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO financial_records (company_id, year, period, orgnr, period_start,
                                                period_end, currency, accounts, revenue, profit,
                                                employees, be, tr, raw_data, validation_status,
                                                validation_errors, validation_warnings, job_id,
                                                created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                 ON CONFLICT(company_id, year, period) DO UPDATE SET
                    orgnr = excluded.orgnr,
                    period_start = excluded.period_start,
                    period_end = excluded.period_end,
                    currency = excluded.currency,
                    accounts = excluded.accounts,
                    revenue = excluded.revenue,
                    profit = excluded.profit,
                    employees = excluded.employees,
                    be = excluded.be,
                    tr = excluded.tr,
                    raw_data = excluded.raw_data,
                    validation_status = excluded.validation_status,
                    validation_errors = excluded.validation_errors,
                    validation_warnings = excluded.validation_warnings,
                    job_id = excluded.job_id,
                    updated_at = excluded.updated_at",
            )?;
            for record in records {
                stmt.execute(params![
                    record.company_id,
                    record.year,
                    record.period,
                    record.orgnr,
                    record.period_start.map(|d| d.to_string()),
                    record.period_end.map(|d| d.to_string()),
                    record.currency,
                    serde_json::to_string(&record.accounts)?,
                    record.revenue,
                    record.profit,
                    record.employees,
                    record.be,
                    record.tr,
                    serde_json::to_string(&record.raw_data)?,
                    record.validation_status.to_string(),
                    serde_json::to_string(&record.validation_errors)?,
                    serde_json::to_string(&record.validation_warnings)?,
                    record.job_id.to_string(),
                    record.created_at,
                    record.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub async fn financials_for_job(&self, job_id: Uuid) -> ScrapeResult<Vec<FinancialRecord>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM financial_records WHERE job_id = ?1 ORDER BY company_id, year, period",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| Ok(row_to_record(row)))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    pub async fn financials_for_company(
        &self,
        company_id: &str,
    ) -> ScrapeResult<Vec<FinancialRecord>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM financial_records WHERE company_id = ?1 ORDER BY year, period",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![company_id], |row| Ok(row_to_record(row)))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Distinct report years staged for a company.
    pub async fn financial_years(&self, company_id: &str) -> ScrapeResult<Vec<i32>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT year FROM financial_records WHERE company_id = ?1 ORDER BY year",
        )?;
        let rows = stmt.query_map(params![company_id], |row| row.get(0))?;
        let mut years = Vec::new();
        for year in rows {
            years.push(year?);
        }
        Ok(years)
    }

    /// Write a validation verdict back onto a staged record.
    pub async fn set_validation(
        &self,
        company_id: &str,
        year: i32,
        period: &str,
        status: ValidationStatus,
        errors: &[String],
        warnings: &[String],
    ) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        let updated = conn.execute(
            "UPDATE financial_records
             SET validation_status = ?4, validation_errors = ?5, validation_warnings = ?6,
                 updated_at = ?7
             WHERE company_id = ?1 AND year = ?2 AND period = ?3",
            params![
                company_id,
                year,
                period,
                status.to_string(),
                serde_json::to_string(errors)?,
                serde_json::to_string(warnings)?,
                Utc::now(),
            ],
        )?;
        if updated == 0 {
            return Err(ScrapeError::storage(format!(
                "no staged record for {} {} period {}",
                company_id, year, period
            )));
        }
        Ok(())
    }

    /// Records eligible for migration: `valid`, plus `warning` when asked.
    pub async fn financials_for_migration(
        &self,
        job_id: Uuid,
        include_warnings: bool,
    ) -> ScrapeResult<Vec<FinancialRecord>> {
        let statuses = if include_warnings {
            "('valid', 'warning')"
        } else {
            "('valid')"
        };
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM financial_records
             WHERE job_id = ?1 AND validation_status IN {}
             ORDER BY company_id, year, period",
            RECORD_COLUMNS, statuses
        ))?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| Ok(row_to_record(row)))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Open a migration-run row; finished later via `finish_migration_run`.
    pub async fn start_migration_run(&self, run: &MigrationRun) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        conn.execute(
            "INSERT INTO migration_runs (id, job_id, started_at, finished_at, include_warnings,
                                         skip_duplicates, migrated, skipped, errors, report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.id.to_string(),
                run.job_id.to_string(),
                run.started_at,
                run.finished_at,
                run.include_warnings,
                run.skip_duplicates,
                run.migrated,
                run.skipped,
                run.errors,
                serde_json::to_string(&run.report)?,
            ],
        )?;
        Ok(())
    }

    pub async fn finish_migration_run(&self, run: &MigrationRun) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        conn.execute(
            "UPDATE migration_runs
             SET finished_at = ?2, migrated = ?3, skipped = ?4, errors = ?5, report = ?6
             WHERE id = ?1",
            params![
                run.id.to_string(),
                run.finished_at,
                run.migrated,
                run.skipped,
                run.errors,
                serde_json::to_string(&run.report)?,
            ],
        )?;
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> ScrapeResult<FinancialRecord> {
    let period_start: Option<String> = row.get(4)?;
    let period_end: Option<String> = row.get(5)?;
    let accounts_json: String = row.get(7)?;
    let raw_json: String = row.get(13)?;
    let validation_status: String = row.get(14)?;
    let errors_json: String = row.get(15)?;
    let warnings_json: Option<String> = row.get(16)?;
    let job_key: String = row.get(17)?;
    let created_at: DateTime<Utc> = row.get(18)?;
    let updated_at: DateTime<Utc> = row.get(19)?;

    Ok(FinancialRecord {
        company_id: row.get(0)?,
        year: row.get(1)?,
        period: row.get(2)?,
        orgnr: row.get(3)?,
        period_start: period_start.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        period_end: period_end.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        currency: row.get(6)?,
        accounts: serde_json::from_str(&accounts_json)?,
        revenue: row.get(8)?,
        profit: row.get(9)?,
        employees: row.get(10)?,
        be: row.get(11)?,
        tr: row.get(12)?,
        raw_data: serde_json::from_str(&raw_json)?,
        validation_status: ValidationStatus::from(validation_status),
        validation_errors: serde_json::from_str(&errors_json)?,
        validation_warnings: warnings_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?
            .unwrap_or_default(),
        job_id: Uuid::parse_str(&job_key).map_err(|e| ScrapeError::storage(e.to_string()))?,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(job_id: Uuid, company_id: &str, year: i32) -> FinancialRecord {
        let mut accounts = BTreeMap::new();
        accounts.insert("SDI".to_string(), 44_212_i64);
        accounts.insert("DR".to_string(), 5_100_i64);
        accounts.insert("EK".to_string(), 5_666_i64);
        FinancialRecord::from_accounts(
            job_id,
            company_id,
            "5561234567",
            year,
            "12",
            NaiveDate::from_ymd_opt(year, 1, 1),
            NaiveDate::from_ymd_opt(year, 12, 31),
            Some("SEK".to_string()),
            accounts,
            serde_json::json!({"companyAccounts": []}),
        )
    }

    #[tokio::test]
    async fn test_upsert_round_trip() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = Uuid::new_v4();
        store
            .upsert_financials(&[record(job_id, "AB12CD34EF56G", 2024)])
            .await
            .unwrap();

        let records = store.financials_for_job(job_id).await.unwrap();
        assert_eq!(records.len(), 1);
        let loaded = &records[0];
        assert_eq!(loaded.amount("SDI"), Some(44_212));
        assert_eq!(loaded.revenue, Some(44_212));
        assert_eq!(loaded.period_end, NaiveDate::from_ymd_opt(2024, 12, 31));
        assert_eq!(loaded.validation_status, ValidationStatus::Pending);
    }

    #[tokio::test]
    async fn test_reports_are_unique_per_company_year_period() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = Uuid::new_v4();
        let first = record(job_id, "AB12CD34EF56G", 2024);
        let mut second = record(job_id, "AB12CD34EF56G", 2024);
        second.accounts.insert("SDI".to_string(), 50_000);
        second.revenue = Some(50_000);

        store.upsert_financials(&[first]).await.unwrap();
        store.upsert_financials(&[second]).await.unwrap();

        let records = store.financials_for_job(job_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].revenue, Some(50_000));
    }

    #[tokio::test]
    async fn test_financial_years_enumeration() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = Uuid::new_v4();
        store
            .upsert_financials(&[
                record(job_id, "AB12CD34EF56G", 2022),
                record(job_id, "AB12CD34EF56G", 2023),
                record(job_id, "AB12CD34EF56G", 2024),
            ])
            .await
            .unwrap();

        let years = store.financial_years("AB12CD34EF56G").await.unwrap();
        assert_eq!(years, vec![2022, 2023, 2024]);
    }

    #[tokio::test]
    async fn test_validation_updates_select_for_migration() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = Uuid::new_v4();
        store
            .upsert_financials(&[
                record(job_id, "AAA1111111111", 2024),
                record(job_id, "BBB2222222222", 2024),
                record(job_id, "CCC3333333333", 2024),
            ])
            .await
            .unwrap();

        store
            .set_validation("AAA1111111111", 2024, "12", ValidationStatus::Valid, &[], &[])
            .await
            .unwrap();
        store
            .set_validation(
                "BBB2222222222",
                2024,
                "12",
                ValidationStatus::Warning,
                &[],
                &["Revenue is zero".to_string()],
            )
            .await
            .unwrap();
        store
            .set_validation(
                "CCC3333333333",
                2024,
                "12",
                ValidationStatus::Invalid,
                &["Missing year".to_string()],
                &[],
            )
            .await
            .unwrap();

        let strict = store.financials_for_migration(job_id, false).await.unwrap();
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].company_id, "AAA1111111111");

        let lenient = store.financials_for_migration(job_id, true).await.unwrap();
        assert_eq!(lenient.len(), 2);
    }
}
