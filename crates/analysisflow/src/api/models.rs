// crates/analysisflow/src/api/models.rs
use serde::{Deserialize, Serialize};

use crate::jobs::model::{JobId, JobStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub document_ref: String,
    /// Blank or missing means the default analysis prompt.
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLinks {
    pub status: String,
    pub result: String,
}

impl JobLinks {
    pub fn for_job(job_id: &JobId) -> Self {
        Self {
            status: format!("/jobs/{job_id}/status"),
            result: format!("/jobs/{job_id}/result"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub links: JobLinks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Set on "not ready" replies so pollers can keep going.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}
