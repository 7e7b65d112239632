//! Adapter for the generative image provider (text-to-image and
//! image-to-image with asynchronous status polling).

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

use crate::services::provider::{check_response, with_retries, ProviderError};

/// Wall-clock budget for a generation request to reach a terminal state.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll every 2s for the first 10s, then every 5s.
const FAST_POLL_WINDOW: Duration = Duration::from_secs(10);
const FAST_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SLOW_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Resolution retried once when the provider rejects the requested one.
const FALLBACK_SIZE: u32 = 512;

#[derive(Debug, Clone)]
pub struct TextToImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub guidance: f64,
    pub steps: u32,
    pub seed: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ImageToImageRequest {
    pub prompt: String,
    pub model: String,
    pub steps: u32,
    pub seed: Option<i64>,
    pub image: Vec<u8>,
    pub image_file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct GenerationPoll {
    pub status: GenerationStatus,
    pub result_url: Option<String>,
}

/// Submit/poll contract for the generative image provider. Wire-format
/// quirks stay inside the HTTP implementation.
#[async_trait]
pub trait GenerativeImageClient: Send + Sync {
    async fn submit_text_to_image(
        &self,
        request: &TextToImageRequest,
    ) -> Result<String, ProviderError>;

    async fn submit_image_to_image(
        &self,
        request: &ImageToImageRequest,
    ) -> Result<String, ProviderError>;

    async fn poll_status(&self, provider_request_id: &str)
        -> Result<GenerationPoll, ProviderError>;

    /// Download a result asset from the provider's URL.
    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Poll `provider_request_id` until the provider reports `done` or `failed`,
/// or [`POLL_TIMEOUT`] elapses. Returns the result URL on success.
pub async fn await_completion(
    client: &dyn GenerativeImageClient,
    provider_request_id: &str,
) -> Result<String, ProviderError> {
    let started = tokio::time::Instant::now();
    loop {
        let poll = client.poll_status(provider_request_id).await?;
        match poll.status {
            GenerationStatus::Done => {
                return poll
                    .result_url
                    .filter(|url| !url.is_empty())
                    .ok_or(ProviderError::MissingResult);
            }
            GenerationStatus::Failed => {
                return Err(ProviderError::Failed(format!(
                    "generation request {provider_request_id} reported status failed"
                )));
            }
            GenerationStatus::Queued | GenerationStatus::Processing => {}
        }

        if started.elapsed() >= POLL_TIMEOUT {
            return Err(ProviderError::Timeout {
                timeout_secs: POLL_TIMEOUT.as_secs(),
            });
        }

        let interval = if started.elapsed() < FAST_POLL_WINDOW {
            FAST_POLL_INTERVAL
        } else {
            SLOW_POLL_INTERVAL
        };
        sleep(interval).await;
    }
}

/// Whether a rejected text-to-image submission should be retried once at
/// the 512x512 fallback resolution.
fn retries_at_fallback_resolution(err: &ProviderError, width: u32, height: u32) -> bool {
    matches!(err, ProviderError::Permanent { status: 422, .. })
        && (width, height) != (FALLBACK_SIZE, FALLBACK_SIZE)
}

/// HTTP client for the generative image provider.
pub struct HttpGenerativeClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SubmitEnvelope {
    data: SubmitData,
}

#[derive(Deserialize)]
struct SubmitData {
    request_id: String,
}

#[derive(Deserialize)]
struct StatusEnvelope {
    data: StatusData,
}

#[derive(Deserialize)]
struct StatusData {
    status: GenerationStatus,
    result_url: Option<String>,
}

impl HttpGenerativeClient {
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

    async fn post_txt2img(
        &self,
        request: &TextToImageRequest,
        width: u32,
        height: u32,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/client/txt2img", self.base_url);
        let body = serde_json::json!({
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt,
            "model": request.model,
            "width": width,
            "height": height,
            "guidance": request.guidance,
            "steps": request.steps,
            "seed": request.seed,
        });

        let response = with_retries("txt2img", || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;
            check_response(response).await
        })
        .await?;

        let envelope: SubmitEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(envelope.data.request_id)
    }

    fn img2img_form(&self, request: &ImageToImageRequest) -> Result<Form, ProviderError> {
        let image_part = Part::bytes(request.image.clone())
            .file_name(request.image_file_name.clone())
            .mime_str("application/octet-stream")?;

        let mut form = Form::new()
            .text("prompt", request.prompt.clone())
            .text("model", request.model.clone())
            .text("steps", request.steps.to_string())
            .part("image", image_part);
        if let Some(seed) = request.seed {
            form = form.text("seed", seed.to_string());
        }
        Ok(form)
    }
}

#[async_trait]
impl GenerativeImageClient for HttpGenerativeClient {
    async fn submit_text_to_image(
        &self,
        request: &TextToImageRequest,
    ) -> Result<String, ProviderError> {
        match self.post_txt2img(request, request.width, request.height).await {
            Err(err) if retries_at_fallback_resolution(&err, request.width, request.height) => {
                tracing::warn!(
                    width = request.width,
                    height = request.height,
                    error = %err,
                    "resolution rejected, retrying once at 512x512"
                );
                self.post_txt2img(request, FALLBACK_SIZE, FALLBACK_SIZE).await
            }
            other => other,
        }
    }

    async fn submit_image_to_image(
        &self,
        request: &ImageToImageRequest,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/client/img2img", self.base_url);

        let response = with_retries("img2img", || async {
            let form = self.img2img_form(request)?;
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

        let envelope: SubmitEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(envelope.data.request_id)
    }

    async fn poll_status(
        &self,
        provider_request_id: &str,
    ) -> Result<GenerationPoll, ProviderError> {
        let url = format!(
            "{}/client/request-status/{}",
            self.base_url, provider_request_id
        );

        let response = with_retries("request-status", || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            check_response(response).await
        })
        .await?;

        let envelope: StatusEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(GenerationPoll {
            status: envelope.data.status,
            result_url: envelope.data.result_url,
        })
    }

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        let response = with_retries("fetch-asset", || async {
            let response = self.http.get(url).send().await?;
            check_response(response).await
        })
        .await?;

        Ok(response.bytes().await?.to_vec())
    }
}
