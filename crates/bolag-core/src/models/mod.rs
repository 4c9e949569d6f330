//! Core data model for the scraping pipeline: jobs and filters, staged
//! companies, id mappings, financial records, and checkpoints.

pub mod checkpoint;
pub mod company;
pub mod financials;
pub mod job;

pub use checkpoint::{Checkpoint, ResumeInfo};
pub use company::{CompanyIdMapping, CompanyStatus, MappingStatus, StagingCompany};
pub use financials::{
    is_known_account_code, CompanyDetails, FinancialRecord, ValidationStatus, ACCOUNT_CODES,
};
pub use job::{Filters, Job, JobStage, JobStatus, JobType};
