use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::JobStage;

/// **Checkpoint Model**
///
/// Per-(job, stage) progress snapshot. `processed_count` is monotonic: the
/// store refuses to write a snapshot that would move it backwards. The `data`
/// blob is stage-scoped and opaque to everything but the stage that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: Uuid,
    pub stage: JobStage,
    pub last_processed_page: i64,
    pub last_processed_company: Option<String>,
    pub processed_count: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub data: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_id: Uuid, stage: JobStage) -> Self {
        Self {
            job_id,
            stage,
            last_processed_page: 0,
            last_processed_company: None,
            processed_count: 0,
            error_count: 0,
            last_error: None,
            data: None,
            updated_at: Utc::now(),
        }
    }
}

/// Resume information derived by joining job status with the latest
/// checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub can_resume: bool,
    pub last_stage: JobStage,
    pub last_page: i64,
    pub processed_count: i64,
    pub total_companies: i64,
}
