//! HTTP adapters for the customization pipeline.
//!
//! Long-running stages are accepted with 202 and run as background tasks;
//! callers poll the cheap job-status endpoint backed by the store instead
//! of the server holding a connection open across provider polling.

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::customization::{
    ErrorResponse, GenerateDesignRequest, JobAcceptedResponse, JobStatusResponse,
    TryOnAcceptedResponse,
};
use crate::models::job::CustomizationJob;
use crate::services::pipeline::PipelineError;
use crate::services::tryon::TryOnStatus;

/// Accepted upload extensions for garment and person photos.
const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Caller-visible failure: status plus a safe message, never raw detail.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        if err.is_validation() {
            return ApiError::bad_request(err.to_string());
        }
        match err {
            PipelineError::Provider(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                message: "the image generation service is temporarily unavailable".to_string(),
            },
            _ => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "customization failed, please try again".to_string(),
            },
        }
    }
}

/// POST /api/v1/customizations/design — generate a standalone print design.
pub async fn generate_design(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateDesignRequest>,
) -> Result<(StatusCode, Json<JobAcceptedResponse>), ApiError> {
    let user_id = require_user(&headers)?;
    check_rate_limit(&state, &user_id)?;
    request
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let job = state
        .pipeline
        .begin_design_job(&user_id, &request.prompt)
        .await?;
    let response = accepted(&job);

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let job_id = job.id;
        if let Err(err) = pipeline.run_design_generation(job).await {
            tracing::warn!(job_id = %job_id, error = %err, "background design generation failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /api/v1/customizations/garment — direct garment generation
/// (multipart: `prompt` text field + `garment` file field).
pub async fn generate_garment(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JobAcceptedResponse>), ApiError> {
    let user_id = require_user(&headers)?;
    check_rate_limit(&state, &user_id)?;

    let mut prompt: Option<String> = None;
    let mut garment: Option<Vec<u8>> = None;

    while let Some(field) = next_field(&mut multipart).await? {
        match field.name() {
            Some("prompt") => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| ApiError::bad_request("malformed prompt field"))?;
                prompt = Some(text);
            }
            Some("garment") => {
                let (_, data) = read_image_field(field).await?;
                garment = Some(data);
            }
            _ => {}
        }
    }

    let prompt = prompt.ok_or_else(|| ApiError::bad_request("prompt is required"))?;
    let garment = garment.ok_or_else(|| ApiError::bad_request("garment image is required"))?;

    let job = state
        .pipeline
        .begin_garment_job(&user_id, &prompt, &garment)
        .await?;
    let response = accepted(&job);

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let job_id = job.id;
        if let Err(err) = pipeline.run_garment_generation(job, garment).await {
            tracing::warn!(job_id = %job_id, error = %err, "background garment generation failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /api/v1/customizations/{job_id}/apply — composite the job's design
/// onto an uploaded garment photo (multipart: `garment` file field).
pub async fn apply_design(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JobAcceptedResponse>), ApiError> {
    let user_id = require_user(&headers)?;
    check_rate_limit(&state, &user_id)?;

    let garment = read_single_image(&mut multipart, "garment")
        .await?
        .ok_or_else(|| ApiError::bad_request("garment image is required"))?
        .1;

    let job = state
        .pipeline
        .prepare_apply_design(&user_id, job_id, &garment)
        .await?;
    let response = accepted(&job);

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let job_id = job.id;
        if let Err(err) = pipeline.run_apply_design(job, garment).await {
            tracing::warn!(job_id = %job_id, error = %err, "background design application failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /api/v1/customizations/{job_id}/tryon — submit the finalized
/// garment for virtual try-on (multipart: `person` file field).
///
/// Submission is a single provider round-trip, so it is handled inline.
pub async fn start_try_on(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<TryOnAcceptedResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    check_rate_limit(&state, &user_id)?;

    let (person_file_name, person) = read_single_image(&mut multipart, "person")
        .await?
        .ok_or_else(|| ApiError::bad_request("person image is required"))?;

    let outcome = state
        .pipeline
        .start_try_on(&user_id, job_id, person, &person_file_name)
        .await?;

    Ok(Json(TryOnAcceptedResponse {
        job_id: outcome.job_id,
        try_on_job_id: outcome.try_on_job_id,
        status_url: outcome.status_url,
    }))
}

/// GET /api/v1/customizations/{job_id} — cheap status read from the store.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    let job = state.pipeline.job_status(&user_id, job_id).await?;
    Ok(Json(JobStatusResponse::from(&job)))
}

/// GET /api/v1/tryon/status/{try_on_job_id} — provider status, folded back
/// into the owning job on terminal states.
///
/// Rate-limited like the mutation endpoints: every call is a provider
/// round-trip. The store-backed job read above is the cheap poll target.
pub async fn get_try_on_status(
    State(state): State<AppState>,
    Path(try_on_job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TryOnStatus>, ApiError> {
    let user_id = require_user(&headers)?;
    check_rate_limit(&state, &user_id)?;
    let status = state.pipeline.get_try_on_status(&try_on_job_id).await?;
    Ok(Json(status))
}

fn accepted(job: &CustomizationJob) -> JobAcceptedResponse {
    JobAcceptedResponse {
        job_id: job.id,
        status: job.status,
        status_url: format!("/api/v1/customizations/{}", job.id),
    }
}

fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: "missing x-user-id header".to_string(),
        })
}

fn check_rate_limit(state: &AppState, user_id: &str) -> Result<(), ApiError> {
    if state.rate_limiter.check(user_id).is_allowed() {
        return Ok(());
    }
    metrics::counter!("rate_limited_requests_total").increment(1);
    Err(ApiError {
        status: StatusCode::TOO_MANY_REQUESTS,
        message: "rate limit exceeded, try again shortly".to_string(),
    })
}

async fn next_field(
    multipart: &mut Multipart,
) -> Result<Option<axum::extract::multipart::Field<'_>>, ApiError> {
    multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("malformed multipart body"))
}

/// Read and validate one image file field by name.
async fn read_single_image(
    multipart: &mut Multipart,
    field_name: &str,
) -> Result<Option<(String, Vec<u8>)>, ApiError> {
    while let Some(field) = next_field(multipart).await? {
        if field.name() == Some(field_name) {
            return read_image_field(field).await.map(Some);
        }
    }
    Ok(None)
}

/// Validate an uploaded image field and return its (file name, bytes).
async fn read_image_field(
    field: axum::extract::multipart::Field<'_>,
) -> Result<(String, Vec<u8>), ApiError> {
    let file_name = field.file_name().unwrap_or("upload.png").to_string();
    validate_extension(&file_name)?;

    let data = field
        .bytes()
        .await
        .map_err(|_| ApiError::bad_request("malformed image upload"))?;

    // Reject files whose content is not a decodable image format.
    image::guess_format(&data)
        .map_err(|_| ApiError::bad_request("unsupported or corrupt image file"))?;

    Ok((file_name, data.to_vec()))
}

fn validate_extension(file_name: &str) -> Result<(), ApiError> {
    let extension = file_name
        .rsplit('.')
        .next()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ApiError::bad_request(
            "unsupported file type: expected .jpg, .jpeg, .png or .webp",
        ))
    }
}
