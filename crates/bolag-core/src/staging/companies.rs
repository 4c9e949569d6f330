//! Staged company rows, id mappings, and company details.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{CompanyDetails, CompanyIdMapping, CompanyStatus, MappingStatus, StagingCompany};

use super::{CompanyListOptions, CompanyPage, StagingStore};

const COMPANY_COLUMNS: &str = "job_id, orgnr, company_name, company_id, company_id_hint,
    homepage, nace_categories, segment_name, revenue_sek, profit_sek, foundation_year,
    accounts_last_year, scraped_at, status, error_message, updated_at";

impl StagingStore {
    /// Upsert a batch of stage-1 companies in one transaction.
    ///
    /// Conflicting rows refresh the listing fields but never regress: an
    /// already-resolved `company_id` is kept and the per-stage status stays
    /// where it is, which makes page re-fetches after a resume idempotent.
    pub async fn upsert_companies(&self, companies: &[StagingCompany]) -> ScrapeResult<usize> {
        if companies.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO companies (job_id, orgnr, company_name, company_id, company_id_hint,
                                        homepage, nace_categories, segment_name, revenue_sek,
                                        profit_sek, foundation_year, accounts_last_year,
                                        scraped_at, status, error_message, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(job_id, orgnr) DO UPDATE SET
                    company_name = excluded.company_name,
                    company_id = COALESCE(companies.company_id, excluded.company_id),
                    company_id_hint = COALESCE(excluded.company_id_hint, companies.company_id_hint),
                    homepage = excluded.homepage,
                    nace_categories = excluded.nace_categories,
                    segment_name = excluded.segment_name,
                    revenue_sek = excluded.revenue_sek,
                    profit_sek = excluded.profit_sek,
                    foundation_year = excluded.foundation_year,
                    accounts_last_year = excluded.accounts_last_year,
                    scraped_at = excluded.scraped_at,
                    updated_at = excluded.updated_at",
            )?;
            for company in companies {
                stmt.execute(params![
                    company.job_id.to_string(),
                    company.orgnr,
                    company.company_name,
                    company.company_id,
                    company.company_id_hint,
                    company.homepage,
                    serde_json::to_string(&company.nace_categories)?,
                    serde_json::to_string(&company.segment_name)?,
                    company.revenue_sek,
                    company.profit_sek,
                    company.foundation_year,
                    company.accounts_last_year,
                    company.scraped_at,
                    company.status.to_string(),
                    company.error_message,
                    company.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(companies.len())
    }

    pub async fn get_company(
        &self,
        job_id: Uuid,
        orgnr: &str,
    ) -> ScrapeResult<Option<StagingCompany>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM companies WHERE job_id = ?1 AND orgnr = ?2",
            COMPANY_COLUMNS
        ))?;
        let mut rows = stmt.query(params![job_id.to_string(), orgnr])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_company(row)?)),
            None => Ok(None),
        }
    }

    /// Companies in a given per-stage status, in insertion order.
    pub async fn companies_by_status(
        &self,
        job_id: Uuid,
        status: CompanyStatus,
    ) -> ScrapeResult<Vec<StagingCompany>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM companies WHERE job_id = ?1 AND status = ?2 ORDER BY rowid",
            COMPANY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![job_id.to_string(), status.to_string()], |row| {
            Ok(row_to_company(row))
        })?;
        let mut companies = Vec::new();
        for row in rows {
            companies.push(row??);
        }
        Ok(companies)
    }

    /// Advance a company's status. Monotonicity is enforced here: regressions
    /// are rejected as storage errors, transitions into `error` always pass.
    pub async fn set_company_status(
        &self,
        job_id: Uuid,
        orgnr: &str,
        status: CompanyStatus,
        error_message: Option<&str>,
    ) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        let current: String = conn
            .query_row(
                "SELECT status FROM companies WHERE job_id = ?1 AND orgnr = ?2",
                params![job_id.to_string(), orgnr],
                |row| row.get(0),
            )
            .map_err(|_| ScrapeError::storage(format!("company {} not staged", orgnr)))?;
        let current = CompanyStatus::from(current);
        if !current.can_advance_to(status) {
            return Err(ScrapeError::storage(format!(
                "refusing status regression {} -> {} for {}",
                current, status, orgnr
            )));
        }
        conn.execute(
            "UPDATE companies SET status = ?3, error_message = ?4, updated_at = ?5
             WHERE job_id = ?1 AND orgnr = ?2",
            params![
                job_id.to_string(),
                orgnr,
                status.to_string(),
                error_message,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    /// Record a stage-2 resolution: mapping row plus company advancement, in
    /// one transaction.
    pub async fn record_resolution(&self, mapping: &CompanyIdMapping) -> ScrapeResult<()> {
        let mut conn = self.connection().lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO company_id_mappings (job_id, orgnr, company_id, source,
                                              confidence_score, status, error_message,
                                              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(job_id, orgnr) DO UPDATE SET
                company_id = excluded.company_id,
                source = excluded.source,
                confidence_score = excluded.confidence_score,
                status = excluded.status,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at",
            params![
                mapping.job_id.to_string(),
                mapping.orgnr,
                mapping.company_id,
                mapping.source,
                mapping.confidence_score,
                mapping.status.to_string(),
                mapping.error_message,
                mapping.created_at,
                mapping.updated_at,
            ],
        )?;
        if mapping.status == MappingStatus::Resolved {
            tx.execute(
                "UPDATE companies SET company_id = ?3, status = 'id_resolved', updated_at = ?4
                 WHERE job_id = ?1 AND orgnr = ?2 AND status = 'pending'",
                params![
                    mapping.job_id.to_string(),
                    mapping.orgnr,
                    mapping.company_id,
                    Utc::now(),
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE companies SET status = 'error', error_message = ?3, updated_at = ?4
                 WHERE job_id = ?1 AND orgnr = ?2",
                params![
                    mapping.job_id.to_string(),
                    mapping.orgnr,
                    mapping.error_message,
                    Utc::now(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn get_mapping(
        &self,
        job_id: Uuid,
        orgnr: &str,
    ) -> ScrapeResult<Option<CompanyIdMapping>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT job_id, orgnr, company_id, source, confidence_score, status,
                    error_message, created_at, updated_at
             FROM company_id_mappings WHERE job_id = ?1 AND orgnr = ?2",
        )?;
        let mut rows = stmt.query(params![job_id.to_string(), orgnr])?;
        match rows.next()? {
            Some(row) => {
                let job_key: String = row.get(0)?;
                let status: String = row.get(5)?;
                Ok(Some(CompanyIdMapping {
                    job_id: Uuid::parse_str(&job_key)
                        .map_err(|e| ScrapeError::storage(e.to_string()))?,
                    orgnr: row.get(1)?,
                    company_id: row.get(2)?,
                    source: row.get(3)?,
                    confidence_score: row.get(4)?,
                    status: MappingStatus::from(status),
                    error_message: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Paginated listing for the control surface.
    pub async fn list_companies(
        &self,
        job_id: Uuid,
        options: &CompanyListOptions,
    ) -> ScrapeResult<CompanyPage> {
        let limit = if options.limit == 0 { 50 } else { options.limit };
        let page = options.page.max(1);
        let offset = (page - 1) as i64 * limit as i64;

        let mut clauses = vec!["job_id = ?1".to_string()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(job_id.to_string())];
        if let Some(status) = options.status {
            values.push(Box::new(status.to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(search) = options.search.as_deref().filter(|s| !s.is_empty()) {
            values.push(Box::new(format!("%{}%", search)));
            clauses.push(format!(
                "(company_name LIKE ?{n} OR orgnr LIKE ?{n})",
                n = values.len()
            ));
        }
        let where_clause = clauses.join(" AND ");

        let conn = self.connection().lock().await;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM companies WHERE {}", where_clause),
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM companies WHERE {} ORDER BY rowid LIMIT {} OFFSET {}",
            COMPANY_COLUMNS, where_clause, limit, offset
        ))?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| Ok(row_to_company(row)),
        )?;
        let mut companies = Vec::new();
        for row in rows {
            companies.push(row??);
        }

        Ok(CompanyPage {
            rows: companies,
            total,
            page,
            limit,
        })
    }

    /// Upsert the stage-3 company metadata block.
    pub async fn upsert_details(&self, details: &CompanyDetails) -> ScrapeResult<()> {
        let conn = self.connection().lock().await;
        conn.execute(
            "INSERT INTO company_details (orgnr, job_id, employees, description, phone, email,
                                          legal_name, domicile, signatory, directors,
                                          foundation_date, business_unit_type, industries,
                                          certificates, external_links, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(orgnr) DO UPDATE SET
                job_id = excluded.job_id,
                employees = excluded.employees,
                description = excluded.description,
                phone = excluded.phone,
                email = excluded.email,
                legal_name = excluded.legal_name,
                domicile = excluded.domicile,
                signatory = excluded.signatory,
                directors = excluded.directors,
                foundation_date = excluded.foundation_date,
                business_unit_type = excluded.business_unit_type,
                industries = excluded.industries,
                certificates = excluded.certificates,
                external_links = excluded.external_links,
                updated_at = excluded.updated_at",
            params![
                details.orgnr,
                details.job_id.to_string(),
                details.employees,
                details.description,
                details.phone,
                details.email,
                details.legal_name,
                details.domicile,
                details.signatory,
                serde_json::to_string(&details.directors)?,
                details.foundation_date,
                details.business_unit_type,
                serde_json::to_string(&details.industries)?,
                serde_json::to_string(&details.certificates)?,
                serde_json::to_string(&details.external_links)?,
                Utc::now(),
            ],
        )?;
        Ok(())
    }
}

fn row_to_company(row: &Row<'_>) -> ScrapeResult<StagingCompany> {
    let job_key: String = row.get(0)?;
    let nace_json: String = row.get(6)?;
    let segment_json: String = row.get(7)?;
    let scraped_at: DateTime<Utc> = row.get(12)?;
    let status: String = row.get(13)?;
    let updated_at: DateTime<Utc> = row.get(15)?;

    Ok(StagingCompany {
        job_id: Uuid::parse_str(&job_key).map_err(|e| ScrapeError::storage(e.to_string()))?,
        orgnr: row.get(1)?,
        company_name: row.get(2)?,
        company_id: row.get(3)?,
        company_id_hint: row.get(4)?,
        homepage: row.get(5)?,
        nace_categories: serde_json::from_str(&nace_json)?,
        segment_name: serde_json::from_str(&segment_json)?,
        revenue_sek: row.get(8)?,
        profit_sek: row.get(9)?,
        foundation_year: row.get(10)?,
        accounts_last_year: row.get(11)?,
        scraped_at,
        status: CompanyStatus::from(status),
        error_message: row.get(14)?,
        updated_at,
    })
}
