//! Core crate for the allabolag scraping pipeline: the data model, the error
//! taxonomy, configuration loading, and the embedded per-job staging store.

pub mod config;
pub mod error;
pub mod models;
pub mod staging;

pub use config::{EngineConfig, ProviderConfig, ProxyConfig, ProxyType, SessionType};
pub use error::{ScrapeError, ScrapeResult};
pub use staging::{
    CompanyListOptions, CompanyPage, FailureRow, JobProgressSummary, MigrationRun, StagingStore,
};

/// Re-export commonly used types
pub use chrono::{DateTime, NaiveDate, Utc};
pub use uuid::Uuid;
