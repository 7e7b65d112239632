use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{CustomizationJob, JobStatus};

/// Request to generate a standalone print design from a prompt.
#[derive(Debug, Deserialize, Validate)]
pub struct GenerateDesignRequest {
    #[garde(length(min = 1, max = 2000))]
    pub prompt: String,
}

/// Response after a customization stage has been accepted for processing.
#[derive(Debug, Serialize)]
pub struct JobAcceptedResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub status_url: String,
}

/// Response after a try-on submission.
#[derive(Debug, Serialize)]
pub struct TryOnAcceptedResponse {
    pub job_id: Uuid,
    pub try_on_job_id: String,
    pub status_url: Option<String>,
}

/// Response for querying a customization job.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub design_image_url: Option<String>,
    pub generated_garment_url: Option<String>,
    pub final_product_image_url: Option<String>,
    pub try_on_result_url: Option<String>,
    pub error: Option<String>,
}

impl From<&CustomizationJob> for JobStatusResponse {
    fn from(job: &CustomizationJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            design_image_url: job.design_image_url.clone(),
            generated_garment_url: job.generated_garment_url.clone(),
            final_product_image_url: job.final_product_image_url.clone(),
            try_on_result_url: job.try_on_result_url.clone(),
            error: job.last_error.clone(),
        }
    }
}

/// Structured failure body returned to callers; carries only a safe message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
