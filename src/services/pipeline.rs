//! The pipeline orchestrator: drives the generative image provider, the
//! try-on provider, the compositor, and the stores against the job state
//! machine.
//!
//! Long-running operations are split into a `prepare_*` step (validation
//! and job creation; nothing is persisted to a job on validation failure)
//! and a `run_*` step (provider round-trips and store writes; any failure
//! marks the job Failed and re-raises). The composite operations combine
//! both for callers that want the full flow in one await; the HTTP layer
//! calls `prepare_*`, spawns `run_*`, and serves status reads from the
//! job store.

use base64::Engine;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::db::jobs::{JobStore, StoreError};
use crate::models::job::{CustomizationJob, InvalidTransition, JobStatus};
use crate::services::compositor::{self, CompositorError};
use crate::services::generation::{
    await_completion, GenerativeImageClient, ImageToImageRequest, TextToImageRequest,
};
use crate::services::provider::ProviderError;
use crate::services::storage::{ImageStore, StorageError};
use crate::services::tryon::{TryOnClient, TryOnStatus};

/// Framing appended to the user's prompt for standalone design generation,
/// steering the provider toward a print-ready standalone graphic.
const DESIGN_PROMPT_SUFFIX: &str = ", graphic design, centered composition, transparent background, print-ready, no clothing, no model, no background scene";

const DESIGN_NEGATIVE_PROMPT: &str =
    "clothing, model, person, mannequin, background scene, watermark";

/// Prompt for re-rendering a pre-composited garment via image-to-image.
const APPLY_DESIGN_PROMPT: &str = "apply the printed design to the garment exactly as placed, photorealistic fabric print, preserve the garment's original color, lighting and folds";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Compositor(#[from] CompositorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl PipelineError {
    fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, PipelineError::Validation(_))
    }
}

#[derive(Debug, Clone)]
pub struct DesignOutcome {
    pub job_id: Uuid,
    pub design_image_url: String,
}

#[derive(Debug, Clone)]
pub struct ProductOutcome {
    pub job_id: Uuid,
    pub final_product_image_url: String,
}

#[derive(Debug, Clone)]
pub struct TryOnStartOutcome {
    pub job_id: Uuid,
    pub try_on_job_id: String,
    pub status_url: Option<String>,
}

/// Generation tunables, sourced from [`crate::config::AppConfig`].
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub size: u32,
    pub steps: u32,
    pub guidance: f64,
}

pub struct PipelineOrchestrator {
    jobs: Arc<dyn JobStore>,
    images: Arc<dyn ImageStore>,
    generation: Arc<dyn GenerativeImageClient>,
    tryon: Arc<dyn TryOnClient>,
    settings: GenerationSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        images: Arc<dyn ImageStore>,
        generation: Arc<dyn GenerativeImageClient>,
        tryon: Arc<dyn TryOnClient>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            jobs,
            images,
            generation,
            tryon,
            settings,
        }
    }

    // ── Design generation ────────────────────────────────────────────

    /// Generate a standalone print design from a prompt.
    pub async fn generate_design_from_prompt(
        &self,
        user_id: &str,
        prompt: &str,
    ) -> Result<DesignOutcome, PipelineError> {
        let job = self.begin_design_job(user_id, prompt).await?;
        self.run_design_generation(job).await
    }

    /// Validate inputs and create the job record.
    pub async fn begin_design_job(
        &self,
        user_id: &str,
        prompt: &str,
    ) -> Result<CustomizationJob, PipelineError> {
        let user_id = validated_user_id(user_id)?;
        let prompt = validated_prompt(prompt)?;

        let job = self.jobs.add(CustomizationJob::new(user_id, prompt)).await?;
        metrics::counter!("customization_jobs_total").increment(1);
        tracing::info!(job_id = %job.id, user_id = %job.user_id, "design generation job created");
        Ok(job)
    }

    /// Run the provider round-trip for a prepared design job.
    pub async fn run_design_generation(
        &self,
        mut job: CustomizationJob,
    ) -> Result<DesignOutcome, PipelineError> {
        let started = Instant::now();
        match self.design_stage(&mut job).await {
            Ok(outcome) => {
                metrics::histogram!("customization_stage_seconds", "stage" => "design")
                    .record(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(err) => {
                self.mark_failed(&mut job, &err).await;
                Err(err)
            }
        }
    }

    async fn design_stage(
        &self,
        job: &mut CustomizationJob,
    ) -> Result<DesignOutcome, PipelineError> {
        let request = TextToImageRequest {
            prompt: format!("{}{DESIGN_PROMPT_SUFFIX}", job.prompt),
            negative_prompt: DESIGN_NEGATIVE_PROMPT.to_string(),
            model: self.settings.model.clone(),
            width: self.settings.size,
            height: self.settings.size,
            guidance: self.settings.guidance,
            steps: self.settings.steps,
            seed: None,
        };

        let request_id = self.generation.submit_text_to_image(&request).await?;
        job.provider_request_id = Some(request_id.clone());
        self.jobs.update(job).await?;
        tracing::info!(job_id = %job.id, provider_request_id = %request_id, "design generation submitted");

        let result_url = await_completion(self.generation.as_ref(), &request_id).await?;
        let design_bytes = self.generation.fetch_asset(&result_url).await?;

        let design_url = self
            .images
            .upload(&design_bytes, &format!("design-{}.png", job.id), "designs")
            .await?;

        job.design_image_url = Some(design_url.clone());
        job.advance_to(JobStatus::DesignGenerated)?;
        self.jobs.update(job).await?;
        tracing::info!(job_id = %job.id, design_url = %design_url, "design generated");

        Ok(DesignOutcome {
            job_id: job.id,
            design_image_url: design_url,
        })
    }

    // ── Apply design to garment ──────────────────────────────────────

    /// Composite a previously generated design onto a garment photo and
    /// re-render it through the provider.
    pub async fn apply_design_to_garment(
        &self,
        user_id: &str,
        job_id: Uuid,
        garment: Vec<u8>,
    ) -> Result<ProductOutcome, PipelineError> {
        let job = self.prepare_apply_design(user_id, job_id, &garment).await?;
        self.run_apply_design(job, garment).await
    }

    /// Validate ownership and design presence; no job mutation.
    pub async fn prepare_apply_design(
        &self,
        user_id: &str,
        job_id: Uuid,
        garment: &[u8],
    ) -> Result<CustomizationJob, PipelineError> {
        let user_id = validated_user_id(user_id)?;
        if garment.is_empty() {
            return Err(PipelineError::validation("garment image is required"));
        }

        let job = self.load_owned_job(user_id, job_id).await?;
        if job.design_image_url.is_none() {
            return Err(PipelineError::validation(
                "job has no generated design to apply",
            ));
        }
        Ok(job)
    }

    pub async fn run_apply_design(
        &self,
        mut job: CustomizationJob,
        garment: Vec<u8>,
    ) -> Result<ProductOutcome, PipelineError> {
        let started = Instant::now();
        match self.apply_stage(&mut job, &garment).await {
            Ok(outcome) => {
                metrics::histogram!("customization_stage_seconds", "stage" => "apply_design")
                    .record(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(err) => {
                self.mark_failed(&mut job, &err).await;
                Err(err)
            }
        }
    }

    async fn apply_stage(
        &self,
        job: &mut CustomizationJob,
        garment: &[u8],
    ) -> Result<ProductOutcome, PipelineError> {
        let design_url = job
            .design_image_url
            .clone()
            .ok_or_else(|| PipelineError::validation("job has no generated design to apply"))?;
        let design = self.images.download(&design_url).await?;

        let garment_url = self
            .images
            .upload(garment, &format!("garment-{}.png", job.id), "garments")
            .await?;
        job.source_garment_path = Some(garment_url);

        // Anchor the exact design pixels before the provider stylizes the
        // composite; placement must not depend on prompt fidelity.
        let composed = compositor::compose_design_onto_garment(garment, &design)?;

        let request = ImageToImageRequest {
            prompt: APPLY_DESIGN_PROMPT.to_string(),
            model: self.settings.model.clone(),
            steps: self.settings.steps,
            seed: None,
            image: composed,
            image_file_name: format!("composite-{}.png", job.id),
        };
        let request_id = self.generation.submit_image_to_image(&request).await?;
        job.provider_request_id = Some(request_id.clone());
        self.jobs.update(job).await?;
        tracing::info!(job_id = %job.id, provider_request_id = %request_id, "design application submitted");

        let result_url = await_completion(self.generation.as_ref(), &request_id).await?;
        let generated = self.generation.fetch_asset(&result_url).await?;

        let final_bytes = self.post_process(job.id, garment, generated);
        let final_url = self
            .images
            .upload(&final_bytes, &format!("product-{}.png", job.id), "products")
            .await?;

        job.final_product_image_url = Some(final_url.clone());
        job.advance_to(JobStatus::ProductImageGenerated)?;
        self.jobs.update(job).await?;
        tracing::info!(job_id = %job.id, final_url = %final_url, "product image generated");

        Ok(ProductOutcome {
            job_id: job.id,
            final_product_image_url: final_url,
        })
    }

    // ── Direct garment generation ────────────────────────────────────

    /// Single-call path: render the custom print directly onto the garment
    /// photo, skipping the standalone design step.
    pub async fn generate_garment_from_prompt(
        &self,
        user_id: &str,
        prompt: &str,
        garment: Vec<u8>,
    ) -> Result<ProductOutcome, PipelineError> {
        let job = self.begin_garment_job(user_id, prompt, &garment).await?;
        self.run_garment_generation(job, garment).await
    }

    pub async fn begin_garment_job(
        &self,
        user_id: &str,
        prompt: &str,
        garment: &[u8],
    ) -> Result<CustomizationJob, PipelineError> {
        let user_id = validated_user_id(user_id)?;
        let prompt = validated_prompt(prompt)?;
        if garment.is_empty() {
            return Err(PipelineError::validation("garment image is required"));
        }

        let job = self.jobs.add(CustomizationJob::new(user_id, prompt)).await?;
        metrics::counter!("customization_jobs_total").increment(1);
        tracing::info!(job_id = %job.id, user_id = %job.user_id, "direct garment generation job created");
        Ok(job)
    }

    pub async fn run_garment_generation(
        &self,
        mut job: CustomizationJob,
        garment: Vec<u8>,
    ) -> Result<ProductOutcome, PipelineError> {
        let started = Instant::now();
        match self.garment_stage(&mut job, &garment).await {
            Ok(outcome) => {
                metrics::histogram!("customization_stage_seconds", "stage" => "garment")
                    .record(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(err) => {
                self.mark_failed(&mut job, &err).await;
                Err(err)
            }
        }
    }

    async fn garment_stage(
        &self,
        job: &mut CustomizationJob,
        garment: &[u8],
    ) -> Result<ProductOutcome, PipelineError> {
        let garment_url = self
            .images
            .upload(garment, &format!("garment-{}.png", job.id), "garments")
            .await?;
        job.source_garment_path = Some(garment_url);

        let request = ImageToImageRequest {
            prompt: format!(
                "{}, printed onto the garment, photorealistic fabric print, preserve the garment's original color",
                job.prompt
            ),
            model: self.settings.model.clone(),
            steps: self.settings.steps,
            seed: None,
            image: garment.to_vec(),
            image_file_name: format!("garment-{}.png", job.id),
        };
        let request_id = self.generation.submit_image_to_image(&request).await?;
        job.provider_request_id = Some(request_id.clone());
        self.jobs.update(job).await?;
        tracing::info!(job_id = %job.id, provider_request_id = %request_id, "direct garment generation submitted");

        let result_url = await_completion(self.generation.as_ref(), &request_id).await?;
        let generated = self.generation.fetch_asset(&result_url).await?;

        let render_url = self
            .images
            .upload(
                &generated,
                &format!("garment-render-{}.png", job.id),
                "garments",
            )
            .await?;
        job.generated_garment_url = Some(render_url);
        job.advance_to(JobStatus::GarmentGenerated)?;
        self.jobs.update(job).await?;

        let final_bytes = self.post_process(job.id, garment, generated);
        let final_url = self
            .images
            .upload(&final_bytes, &format!("product-{}.png", job.id), "products")
            .await?;

        job.final_product_image_url = Some(final_url.clone());
        job.advance_to(JobStatus::ProductImageGenerated)?;
        self.jobs.update(job).await?;
        tracing::info!(job_id = %job.id, final_url = %final_url, "product image generated");

        Ok(ProductOutcome {
            job_id: job.id,
            final_product_image_url: final_url,
        })
    }

    // ── Virtual try-on ───────────────────────────────────────────────

    /// Submit the finalized garment image together with a person photo to
    /// the try-on provider.
    pub async fn start_try_on(
        &self,
        user_id: &str,
        job_id: Uuid,
        person: Vec<u8>,
        person_file_name: &str,
    ) -> Result<TryOnStartOutcome, PipelineError> {
        let user_id = validated_user_id(user_id)?;
        if person.is_empty() {
            return Err(PipelineError::validation("person image is required"));
        }

        let mut job = self.load_owned_job(user_id, job_id).await?;
        let garment_url = job.final_product_image_url.clone().ok_or_else(|| {
            PipelineError::validation("job has no finalized garment image for try-on")
        })?;

        match self
            .try_on_stage(&mut job, &garment_url, &person, person_file_name)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.mark_failed(&mut job, &err).await;
                Err(err)
            }
        }
    }

    async fn try_on_stage(
        &self,
        job: &mut CustomizationJob,
        garment_url: &str,
        person: &[u8],
        person_file_name: &str,
    ) -> Result<TryOnStartOutcome, PipelineError> {
        let garment = self.images.download(garment_url).await?;
        let garment_file_name = garment_url
            .rsplit('/')
            .next()
            .unwrap_or("garment.png")
            .to_string();

        metrics::counter!("tryon_submissions_total").increment(1);
        let submission = self
            .tryon
            .start_try_on(person, person_file_name, &garment, &garment_file_name)
            .await?;

        job.try_on_job_id = Some(submission.job_id.clone());
        job.try_on_status_url = submission.status_url.clone();
        job.advance_to(JobStatus::TryOnStarted)?;
        self.jobs.update(job).await?;
        tracing::info!(job_id = %job.id, try_on_job_id = %submission.job_id, "try-on started");

        Ok(TryOnStartOutcome {
            job_id: job.id,
            try_on_job_id: submission.job_id,
            status_url: submission.status_url,
        })
    }

    /// Fetch the provider's view of a try-on job and fold terminal states
    /// back into the owning customization job. Lookup misses never fail
    /// the call; the provider status is returned regardless.
    pub async fn get_try_on_status(
        &self,
        try_on_job_id: &str,
    ) -> Result<TryOnStatus, PipelineError> {
        if try_on_job_id.trim().is_empty() {
            return Err(PipelineError::validation("try-on job id is required"));
        }

        let status = self.tryon.get_status(try_on_job_id).await?;

        if status.is_completed() {
            if let Err(err) = self.record_try_on_completion(try_on_job_id, &status).await {
                tracing::warn!(try_on_job_id, error = %err, "could not record try-on completion");
            }
        } else if status.is_failed() {
            if let Err(err) = self.record_try_on_failure(try_on_job_id, &status).await {
                tracing::warn!(try_on_job_id, error = %err, "could not record try-on failure");
            }
        }

        Ok(status)
    }

    async fn record_try_on_completion(
        &self,
        try_on_job_id: &str,
        status: &TryOnStatus,
    ) -> Result<(), PipelineError> {
        let Some(mut job) = self.jobs.find_by_try_on_job_id(try_on_job_id).await? else {
            tracing::warn!(try_on_job_id, "no job owns this try-on id");
            return Ok(());
        };
        if job.status == JobStatus::Completed {
            return Ok(());
        }

        let result_url = match (&status.image_url, &status.image_base64) {
            (Some(url), _) => url.clone(),
            (None, Some(encoded)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| {
                        ProviderError::Malformed(format!("invalid base64 try-on image: {e}"))
                    })?;
                self.images
                    .upload(&bytes, &format!("tryon-{}.png", job.id), "tryon")
                    .await?
            }
            (None, None) => return Err(ProviderError::MissingResult.into()),
        };

        job.try_on_result_url = Some(result_url);
        job.advance_to(JobStatus::Completed)?;
        self.jobs.update(&mut job).await?;
        metrics::counter!("customization_jobs_completed").increment(1);
        tracing::info!(job_id = %job.id, try_on_job_id, "customization completed");
        Ok(())
    }

    async fn record_try_on_failure(
        &self,
        try_on_job_id: &str,
        status: &TryOnStatus,
    ) -> Result<(), PipelineError> {
        let Some(mut job) = self.jobs.find_by_try_on_job_id(try_on_job_id).await? else {
            tracing::warn!(try_on_job_id, "no job owns this try-on id");
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        job.fail(status.failure_message());
        self.jobs.update(&mut job).await?;
        metrics::counter!("customization_jobs_failed").increment(1);
        tracing::warn!(job_id = %job.id, try_on_job_id, error = %status.failure_message(), "try-on failed");
        Ok(())
    }

    // ── Shared helpers ───────────────────────────────────────────────

    /// Status read for the cheap polling endpoint.
    pub async fn job_status(
        &self,
        user_id: &str,
        job_id: Uuid,
    ) -> Result<CustomizationJob, PipelineError> {
        let user_id = validated_user_id(user_id)?;
        self.load_owned_job(user_id, job_id).await
    }

    /// Load a job, rejecting cross-user access without revealing whether
    /// the job exists.
    async fn load_owned_job(
        &self,
        user_id: &str,
        job_id: Uuid,
    ) -> Result<CustomizationJob, PipelineError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::validation(format!("job {job_id} not found")))?;
        if !job.is_owned_by(user_id) {
            return Err(PipelineError::validation(format!("job {job_id} not found")));
        }
        Ok(job)
    }

    /// Best-effort color recovery; any failure degrades to the provider's
    /// raw result instead of failing the job.
    fn post_process(&self, job_id: Uuid, original: &[u8], generated: Vec<u8>) -> Vec<u8> {
        match compositor::recover_original_color(original, &generated) {
            Ok(Some(recovered)) => recovered,
            Ok(None) => generated,
            Err(err) => {
                metrics::counter!("customization_post_process_failures").increment(1);
                tracing::warn!(job_id = %job_id, error = %err, "color recovery failed, using raw provider result");
                generated
            }
        }
    }

    async fn mark_failed(&self, job: &mut CustomizationJob, err: &PipelineError) {
        metrics::counter!("customization_jobs_failed").increment(1);
        tracing::error!(job_id = %job.id, error = %err, "pipeline stage failed");
        job.fail(err.to_string());
        if let Err(store_err) = self.jobs.update(job).await {
            tracing::error!(job_id = %job.id, error = %store_err, "could not persist job failure");
        }
    }
}

fn validated_user_id(user_id: &str) -> Result<&str, PipelineError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation("user id is required"));
    }
    Ok(trimmed)
}

fn validated_prompt(prompt: &str) -> Result<&str, PipelineError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation("prompt is required"));
    }
    Ok(trimmed)
}
