//! Staging schema: table set plus additive column migration.
//!
//! `apply` is safe to run on every open. Base tables are created with
//! `IF NOT EXISTS`; columns introduced after the initial schema are added
//! with `ALTER TABLE ... ADD COLUMN`, tolerating stores that already have
//! them. Opening a store written by an older build must never fail on a
//! missing or pre-existing column.

use rusqlite::Connection;
use tracing::debug;

use crate::error::ScrapeResult;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    filter_hash TEXT NOT NULL,
    params TEXT NOT NULL,
    status TEXT NOT NULL,
    stage TEXT NOT NULL,
    last_page INTEGER NOT NULL DEFAULT 0,
    processed_count INTEGER NOT NULL DEFAULT 0,
    total_companies INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS companies (
    job_id TEXT NOT NULL,
    orgnr TEXT NOT NULL,
    company_name TEXT NOT NULL,
    company_id TEXT,
    company_id_hint TEXT,
    homepage TEXT,
    nace_categories TEXT NOT NULL DEFAULT '[]',
    segment_name TEXT NOT NULL DEFAULT '[]',
    revenue_sek INTEGER,
    profit_sek INTEGER,
    foundation_year INTEGER,
    accounts_last_year TEXT,
    scraped_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (job_id, orgnr)
);
CREATE INDEX IF NOT EXISTS idx_companies_job_status ON companies(job_id, status);

CREATE TABLE IF NOT EXISTS company_id_mappings (
    job_id TEXT NOT NULL,
    orgnr TEXT NOT NULL,
    company_id TEXT NOT NULL,
    source TEXT NOT NULL,
    confidence_score REAL NOT NULL DEFAULT 1.0,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (job_id, orgnr)
);

CREATE TABLE IF NOT EXISTS financial_records (
    company_id TEXT NOT NULL,
    year INTEGER NOT NULL,
    period TEXT NOT NULL,
    orgnr TEXT NOT NULL,
    period_start TEXT,
    period_end TEXT,
    currency TEXT NOT NULL DEFAULT 'SEK',
    accounts TEXT NOT NULL DEFAULT '{}',
    revenue INTEGER,
    profit INTEGER,
    employees INTEGER,
    be INTEGER,
    tr INTEGER,
    raw_data TEXT NOT NULL DEFAULT '{}',
    validation_status TEXT NOT NULL DEFAULT 'pending',
    validation_errors TEXT NOT NULL DEFAULT '[]',
    job_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (company_id, year, period)
);
CREATE INDEX IF NOT EXISTS idx_financials_job ON financial_records(job_id);
CREATE INDEX IF NOT EXISTS idx_financials_orgnr ON financial_records(orgnr);

CREATE TABLE IF NOT EXISTS company_details (
    orgnr TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    employees INTEGER,
    description TEXT,
    phone TEXT,
    email TEXT,
    legal_name TEXT,
    domicile TEXT,
    signatory TEXT,
    directors TEXT NOT NULL DEFAULT '[]',
    foundation_date TEXT,
    business_unit_type TEXT,
    industries TEXT NOT NULL DEFAULT '[]',
    certificates TEXT NOT NULL DEFAULT '[]',
    external_links TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    job_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    last_processed_page INTEGER NOT NULL DEFAULT 0,
    last_processed_company TEXT,
    processed_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    data TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (job_id, stage)
);

CREATE TABLE IF NOT EXISTS migration_runs (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    include_warnings INTEGER NOT NULL DEFAULT 0,
    skip_duplicates INTEGER NOT NULL DEFAULT 1,
    migrated INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    report TEXT NOT NULL DEFAULT '[]'
);
";

/// Columns added after the initial schema. Applied additively on every open.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("jobs", "rate_limit_stats", "TEXT"),
    ("companies", "error_message", "TEXT"),
    ("financial_records", "validation_warnings", "TEXT NOT NULL DEFAULT '[]'"),
];

/// Create the base tables and apply additive column migrations.
pub fn apply(conn: &Connection) -> ScrapeResult<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    for (table, column, declaration) in ADDITIVE_COLUMNS {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, declaration);
        match conn.execute(&sql, []) {
            Ok(_) => debug!(table, column, "added staging column"),
            Err(err) if is_duplicate_column(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    err.to_string().contains("duplicate column name")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
    }

    #[test]
    fn test_additive_columns_exist_after_apply() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        // Selecting the migrated columns proves they were added.
        conn.prepare("SELECT rate_limit_stats FROM jobs").unwrap();
        conn.prepare("SELECT error_message FROM companies").unwrap();
        conn.prepare("SELECT validation_warnings FROM financial_records")
            .unwrap();
    }

    #[test]
    fn test_apply_upgrades_pre_migration_store() {
        let conn = Connection::open_in_memory().unwrap();
        // A store created before the additive columns existed.
        conn.execute_batch(
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                filter_hash TEXT NOT NULL,
                params TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                last_page INTEGER NOT NULL DEFAULT 0,
                processed_count INTEGER NOT NULL DEFAULT 0,
                total_companies INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .unwrap();
        apply(&conn).unwrap();
        conn.prepare("SELECT rate_limit_stats FROM jobs").unwrap();
    }
}
