//! Adapter for the virtual try-on provider.
//!
//! Unlike the generative image client this adapter does not poll
//! internally: the upstream exposes status checks as a public endpoint, so
//! status retrieval is a single request-response call driven by the caller.
//! The provider's JSON schema is loose (several spellings per field); the
//! alias scanning is contained here, behind the trait.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::services::provider::{check_response, with_retries, ProviderError};

#[derive(Debug, Clone)]
pub struct TryOnSubmission {
    pub job_id: String,
    pub status_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TryOnStatus {
    pub status: String,
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub provider: Option<String>,
}

impl TryOnStatus {
    pub fn is_completed(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "completed" | "done" | "succeeded"
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status.to_ascii_lowercase().as_str(), "failed" | "error")
    }

    /// Best available human-readable failure reason.
    pub fn failure_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "try-on provider reported failure".to_string())
    }
}

/// Submit/status contract for the virtual try-on provider.
#[async_trait]
pub trait TryOnClient: Send + Sync {
    async fn start_try_on(
        &self,
        person_image: &[u8],
        person_file_name: &str,
        garment_image: &[u8],
        garment_file_name: &str,
    ) -> Result<TryOnSubmission, ProviderError>;

    async fn get_status(&self, try_on_job_id: &str) -> Result<TryOnStatus, ProviderError>;
}

/// HTTP client for the try-on provider.
pub struct HttpTryOnClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpTryOnClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn submission_form(
        person_image: &[u8],
        person_file_name: &str,
        garment_image: &[u8],
        garment_file_name: &str,
    ) -> Result<Form, ProviderError> {
        let person_part = Part::bytes(person_image.to_vec())
            .file_name(person_file_name.to_string())
            .mime_str("application/octet-stream")?;
        let garment_part = Part::bytes(garment_image.to_vec())
            .file_name(garment_file_name.to_string())
            .mime_str("application/octet-stream")?;

        Ok(Form::new()
            .part("person_images", person_part)
            .part("garment_images", garment_part))
    }
}

#[async_trait]
impl TryOnClient for HttpTryOnClient {
    async fn start_try_on(
        &self,
        person_image: &[u8],
        person_file_name: &str,
        garment_image: &[u8],
        garment_file_name: &str,
    ) -> Result<TryOnSubmission, ProviderError> {
        let url = format!("{}/api/v1/tryon", self.base_url);

        let response = with_retries("tryon-start", || async {
            let form = Self::submission_form(
                person_image,
                person_file_name,
                garment_image,
                garment_file_name,
            )?;
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .multipart(form)
                .send()
                .await?;
            check_response(response).await
        })
        .await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parse_submission(&body)
    }

    async fn get_status(&self, try_on_job_id: &str) -> Result<TryOnStatus, ProviderError> {
        let url = format!("{}/api/v1/tryon/status/{}", self.base_url, try_on_job_id);

        let response = with_retries("tryon-status", || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            check_response(response).await
        })
        .await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parse_status(&body)
    }
}

/// Look up a field by any of its known spellings, case-insensitively.
/// Numeric values are accepted and stringified (some providers return
/// numeric job ids).
fn string_field(body: &serde_json::Value, aliases: &[&str]) -> Option<String> {
    let map = body.as_object()?;
    for alias in aliases {
        for (key, value) in map {
            if !key.eq_ignore_ascii_case(alias) {
                continue;
            }
            if let Some(text) = value.as_str() {
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            } else if let Some(number) = value.as_i64() {
                return Some(number.to_string());
            }
        }
    }
    None
}

fn parse_submission(body: &serde_json::Value) -> Result<TryOnSubmission, ProviderError> {
    let job_id = string_field(body, &["jobId", "job_id", "id"]).ok_or_else(|| {
        ProviderError::Malformed("try-on submission response carried no job id".to_string())
    })?;
    let status_url = string_field(body, &["statusUrl", "status_url"]);
    Ok(TryOnSubmission { job_id, status_url })
}

fn parse_status(body: &serde_json::Value) -> Result<TryOnStatus, ProviderError> {
    let status = string_field(body, &["status"]).ok_or_else(|| {
        ProviderError::Malformed("try-on status response carried no status".to_string())
    })?;

    Ok(TryOnStatus {
        status,
        image_url: string_field(body, &["imageUrl", "image_url"]),
        image_base64: string_field(body, &["imageBase64", "image_base64"]),
        message: string_field(body, &["message"]),
        error: string_field(body, &["error"]),
        error_code: string_field(body, &["errorCode", "error_code"]),
        provider: string_field(body, &["provider"]),
    })
}
