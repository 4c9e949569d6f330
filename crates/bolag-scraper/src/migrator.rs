//! **Migrator**
//!
//! Promotes validated staging rows to the production warehouse. The
//! warehouse is reached through the narrow `ProductionStore` seam; the repo
//! ships a SQLite-backed implementation whose `company_accounts_by_id` table
//! carries one dedicated column per account code, plus an in-memory double
//! for tests. Every run is appended to the staging store's migration log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use bolag_core::models::{FinancialRecord, ACCOUNT_CODES};
use bolag_core::{MigrationRun, ScrapeError, ScrapeResult, StagingStore};

/// Minimal interface the migrator needs from the production warehouse.
#[async_trait]
pub trait ProductionStore: Send + Sync {
    async fn has_record(&self, company_id: &str, year: i32) -> ScrapeResult<bool>;
    async fn insert_record(&self, record: &FinancialRecord) -> ScrapeResult<()>;
}

/// Options for one migrate run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    pub include_warnings: bool,
    pub skip_duplicates: bool,
}

/// Result of one migrate run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    pub migrated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub report: Vec<String>,
}

pub struct Migrator {
    store: StagingStore,
    production: Arc<dyn ProductionStore>,
}

impl Migrator {
    pub fn new(store: StagingStore, production: Arc<dyn ProductionStore>) -> Self {
        Self { store, production }
    }

    pub async fn migrate(
        &self,
        job_id: Uuid,
        options: MigrateOptions,
    ) -> ScrapeResult<MigrationSummary> {
        let mut run = MigrationRun {
            id: Uuid::new_v4(),
            job_id,
            started_at: Utc::now(),
            finished_at: None,
            include_warnings: options.include_warnings,
            skip_duplicates: options.skip_duplicates,
            migrated: 0,
            skipped: 0,
            errors: 0,
            report: Vec::new(),
        };
        self.store.start_migration_run(&run).await?;

        let records = self
            .store
            .financials_for_migration(job_id, options.include_warnings)
            .await?;
        info!(%job_id, candidates = records.len(), "starting migration");

        let mut summary = MigrationSummary::default();
        for record in &records {
            let key = format!("{} {}/{}", record.company_id, record.year, record.period);
            if options.skip_duplicates
                && self
                    .production
                    .has_record(&record.company_id, record.year)
                    .await?
            {
                summary.skipped += 1;
                summary.report.push(format!("{}: duplicate", key));
                continue;
            }
            match self.production.insert_record(record).await {
                Ok(()) => {
                    summary.migrated += 1;
                    summary.report.push(format!("{}: migrated", key));
                }
                Err(err) => {
                    warn!(record = %key, error = %err, "migration of record failed");
                    summary.errors += 1;
                    summary.report.push(format!("{}: error: {}", key, err));
                }
            }
        }

        run.finished_at = Some(Utc::now());
        run.migrated = summary.migrated as i64;
        run.skipped = summary.skipped as i64;
        run.errors = summary.errors as i64;
        run.report = summary.report.clone();
        self.store.finish_migration_run(&run).await?;

        info!(
            %job_id,
            migrated = summary.migrated,
            skipped = summary.skipped,
            errors = summary.errors,
            "migration finished"
        );
        Ok(summary)
    }
}

/// SQLite-backed production warehouse. One dedicated column per account
/// code, plus identity and audit columns.
pub struct SqliteProductionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProductionStore {
    pub fn open(path: &std::path::Path) -> ScrapeResult<Self> {
        Self::prepare(Connection::open(path)?)
    }

    pub fn open_in_memory() -> ScrapeResult<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> ScrapeResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let account_columns = ACCOUNT_CODES
            .iter()
            .map(|code| format!("{} INTEGER", code.to_lowercase()))
            .collect::<Vec<_>>()
            .join(",\n                ");
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS company_accounts_by_id (
                company_id TEXT NOT NULL,
                year INTEGER NOT NULL,
                period TEXT NOT NULL,
                orgnr TEXT NOT NULL,
                currency TEXT NOT NULL,
                {},
                revenue INTEGER,
                profit INTEGER,
                employees INTEGER,
                source_job_id TEXT NOT NULL,
                migrated_at TEXT NOT NULL,
                PRIMARY KEY (company_id, year, period)
            )",
                account_columns
            ),
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl ProductionStore for SqliteProductionStore {
    async fn has_record(&self, company_id: &str, year: i32) -> ScrapeResult<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM company_accounts_by_id WHERE company_id = ?1 AND year = ?2",
            rusqlite::params![company_id, year],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn insert_record(&self, record: &FinancialRecord) -> ScrapeResult<()> {
        let column_names = ACCOUNT_CODES
            .iter()
            .map(|code| code.to_lowercase())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (6..6 + ACCOUNT_CODES.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO company_accounts_by_id
                 (company_id, year, period, orgnr, currency, {}, revenue, profit, employees,
                  source_job_id, migrated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, {}, ?{}, ?{}, ?{}, ?{}, ?{})",
            column_names,
            placeholders,
            6 + ACCOUNT_CODES.len(),
            7 + ACCOUNT_CODES.len(),
            8 + ACCOUNT_CODES.len(),
            9 + ACCOUNT_CODES.len(),
            10 + ACCOUNT_CODES.len(),
        );

        let conn = self.conn.lock().await;

        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(record.company_id.clone()),
            Box::new(record.year),
            Box::new(record.period.clone()),
            Box::new(record.orgnr.clone()),
            Box::new(record.currency.clone()),
        ];
        for code in ACCOUNT_CODES {
            values.push(Box::new(record.amount(code)));
        }
        values.push(Box::new(record.revenue));
        values.push(Box::new(record.profit));
        values.push(Box::new(record.employees));
        values.push(Box::new(record.job_id.to_string()));
        values.push(Box::new(Utc::now()));

        conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )
        .map_err(|err| ScrapeError::storage(err.to_string()))?;
        Ok(())
    }
}

/// In-memory production store for tests.
#[derive(Default)]
pub struct InMemoryProductionStore {
    rows: std::sync::Mutex<Vec<FinancialRecord>>,
}

impl InMemoryProductionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<FinancialRecord> {
        self.rows.lock().expect("rows lock").clone()
    }
}

#[async_trait]
impl ProductionStore for InMemoryProductionStore {
    async fn has_record(&self, company_id: &str, year: i32) -> ScrapeResult<bool> {
        Ok(self
            .rows
            .lock()
            .expect("rows lock")
            .iter()
            .any(|r| r.company_id == company_id && r.year == year))
    }

    async fn insert_record(&self, record: &FinancialRecord) -> ScrapeResult<()> {
        self.rows.lock().expect("rows lock").push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::validate_job;
    use std::collections::BTreeMap;

    fn record(job_id: Uuid, company_id: &str, year: i32, sdi: i64) -> FinancialRecord {
        let mut accounts = BTreeMap::new();
        accounts.insert("SDI".to_string(), sdi);
        accounts.insert("DR".to_string(), sdi / 10);
        accounts.insert("EK".to_string(), 1_000);
        FinancialRecord::from_accounts(
            job_id,
            company_id,
            "5561234567",
            year,
            "12",
            None,
            None,
            Some("SEK".to_string()),
            accounts,
            serde_json::json!({}),
        )
    }

    async fn staged_job(store: &StagingStore) -> Uuid {
        let job_id = Uuid::new_v4();
        store
            .upsert_financials(&[
                record(job_id, "AAA1111111111", 2023, 10_000),
                record(job_id, "AAA1111111111", 2024, 12_000),
                record(job_id, "BBB2222222222", 2024, 0), // warns: zero revenue
            ])
            .await
            .unwrap();
        validate_job(store, job_id).await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn test_migrates_valid_rows_only_by_default() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = staged_job(&store).await;
        let production = Arc::new(InMemoryProductionStore::new());
        let migrator = Migrator::new(store, production.clone());

        let summary = migrator
            .migrate(
                job_id,
                MigrateOptions {
                    include_warnings: false,
                    skip_duplicates: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.migrated, 2);
        assert_eq!(summary.errors, 0);
        assert_eq!(production.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_include_warnings_widens_selection() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = staged_job(&store).await;
        let production = Arc::new(InMemoryProductionStore::new());
        let migrator = Migrator::new(store, production.clone());

        let summary = migrator
            .migrate(
                job_id,
                MigrateOptions {
                    include_warnings: true,
                    skip_duplicates: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.migrated, 3);
        assert_eq!(production.rows().len(), 3);
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let store = StagingStore::open_in_memory().unwrap();
        let job_id = staged_job(&store).await;
        let production = Arc::new(InMemoryProductionStore::new());
        let migrator = Migrator::new(store, production.clone());
        let options = MigrateOptions {
            include_warnings: false,
            skip_duplicates: true,
        };

        let first = migrator.migrate(job_id, options).await.unwrap();
        let second = migrator.migrate(job_id, options).await.unwrap();

        assert!(first.migrated >= second.migrated);
        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped, first.migrated);
        assert!(second.report.iter().all(|line| line.contains("duplicate")));
        assert_eq!(production.rows().len(), first.migrated as usize);
    }

    #[tokio::test]
    async fn test_sqlite_production_store_round_trip() {
        let production = SqliteProductionStore::open_in_memory().unwrap();
        let row = record(Uuid::new_v4(), "AAA1111111111", 2024, 10_000);
        production.insert_record(&row).await.unwrap();

        assert!(production.has_record("AAA1111111111", 2024).await.unwrap());
        assert!(!production.has_record("AAA1111111111", 2023).await.unwrap());
        assert!(!production.has_record("CCC0000000000", 2024).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_store_has_dedicated_account_columns() {
        let production = SqliteProductionStore::open_in_memory().unwrap();
        let row = record(Uuid::new_v4(), "AAA1111111111", 2024, 10_000);
        production.insert_record(&row).await.unwrap();

        let conn = production.conn.lock().await;
        let (sdi, dr): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT sdi, dr FROM company_accounts_by_id WHERE company_id = ?1 AND year = 2024",
                rusqlite::params!["AAA1111111111"],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(sdi, Some(10_000));
        assert_eq!(dr, Some(1_000));
    }
}
