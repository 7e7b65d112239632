//! End-to-end pipeline tests against in-memory stores and stub provider
//! clients. These exercise the orchestrator's state bookkeeping, failure
//! semantics, and post-processing fallback without any network I/O.

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use printfit::db::jobs::{JobStore, StoreError};
use printfit::models::job::{CustomizationJob, JobStatus};
use printfit::services::generation::{
    GenerationPoll, GenerationStatus, GenerativeImageClient, ImageToImageRequest,
    TextToImageRequest,
};
use printfit::services::pipeline::{GenerationSettings, PipelineError, PipelineOrchestrator};
use printfit::services::provider::ProviderError;
use printfit::services::storage::{ImageStore, StorageError};
use printfit::services::tryon::{TryOnClient, TryOnStatus, TryOnSubmission};

// ── In-memory collaborators ──────────────────────────────────────────

/// Job store that records every persisted status for the forward-only
/// property checks.
#[derive(Default)]
struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, CustomizationJob>>,
    history: Mutex<Vec<(Uuid, JobStatus)>>,
}

impl InMemoryJobStore {
    fn status_history(&self, job_id: Uuid) -> Vec<JobStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn job(&self, job_id: Uuid) -> CustomizationJob {
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .expect("job should exist")
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add(&self, job: CustomizationJob) -> Result<CustomizationJob, StoreError> {
        self.history.lock().unwrap().push((job.id, job.status));
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CustomizationJob>, StoreError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_try_on_job_id(
        &self,
        try_on_job_id: &str,
    ) -> Result<Option<CustomizationJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|job| job.try_on_job_id.as_deref() == Some(try_on_job_id))
            .cloned())
    }

    async fn update(&self, job: &mut CustomizationJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let stored = jobs.get_mut(&job.id).ok_or(StoreError::NotFound(job.id))?;
        if stored.version != job.version {
            return Err(StoreError::StaleWrite(job.id));
        }
        job.version += 1;
        *stored = job.clone();
        self.history.lock().unwrap().push((job.id, job.status));
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryImageStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ImageStore for InMemoryImageStore {
    async fn upload(
        &self,
        data: &[u8],
        file_name: &str,
        folder: &str,
    ) -> Result<String, StorageError> {
        let url = format!("http://images.test/{folder}/{file_name}");
        self.objects
            .lock()
            .unwrap()
            .insert(url.clone(), data.to_vec());
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(url.to_string()))
    }
}

// ── Stub provider clients ────────────────────────────────────────────

/// Generative client that completes immediately; the asset it serves is
/// swappable between pipeline stages.
struct StubGenerativeClient {
    result_url: String,
    asset: Mutex<Vec<u8>>,
    fail_poll: bool,
    txt_submissions: AtomicU32,
    img_submissions: AtomicU32,
}

impl StubGenerativeClient {
    fn new(asset: Vec<u8>) -> Self {
        Self {
            result_url: "http://provider.test/results/out.png".to_string(),
            asset: Mutex::new(asset),
            fail_poll: false,
            txt_submissions: AtomicU32::new(0),
            img_submissions: AtomicU32::new(0),
        }
    }

    fn failing_poll(asset: Vec<u8>) -> Self {
        Self {
            fail_poll: true,
            ..Self::new(asset)
        }
    }

    fn set_asset(&self, asset: Vec<u8>) {
        *self.asset.lock().unwrap() = asset;
    }
}

#[async_trait]
impl GenerativeImageClient for StubGenerativeClient {
    async fn submit_text_to_image(
        &self,
        _request: &TextToImageRequest,
    ) -> Result<String, ProviderError> {
        let n = self.txt_submissions.fetch_add(1, Ordering::SeqCst);
        Ok(format!("txt-req-{n}"))
    }

    async fn submit_image_to_image(
        &self,
        _request: &ImageToImageRequest,
    ) -> Result<String, ProviderError> {
        let n = self.img_submissions.fetch_add(1, Ordering::SeqCst);
        Ok(format!("img-req-{n}"))
    }

    async fn poll_status(
        &self,
        _provider_request_id: &str,
    ) -> Result<GenerationPoll, ProviderError> {
        if self.fail_poll {
            return Ok(GenerationPoll {
                status: GenerationStatus::Failed,
                result_url: None,
            });
        }
        Ok(GenerationPoll {
            status: GenerationStatus::Done,
            result_url: Some(self.result_url.clone()),
        })
    }

    async fn fetch_asset(&self, _url: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(self.asset.lock().unwrap().clone())
    }
}

struct StubTryOnClient {
    fail_submission: bool,
    status: Mutex<TryOnStatus>,
}

impl StubTryOnClient {
    fn with_status(status: TryOnStatus) -> Self {
        Self {
            fail_submission: false,
            status: Mutex::new(status),
        }
    }

    fn processing() -> Self {
        Self::with_status(tryon_status("processing", None, None))
    }

    fn failing_submission() -> Self {
        Self {
            fail_submission: true,
            status: Mutex::new(tryon_status("processing", None, None)),
        }
    }
}

fn tryon_status(
    status: &str,
    image_url: Option<&str>,
    error: Option<&str>,
) -> TryOnStatus {
    TryOnStatus {
        status: status.to_string(),
        image_url: image_url.map(String::from),
        image_base64: None,
        message: None,
        error: error.map(String::from),
        error_code: None,
        provider: Some("stub".to_string()),
    }
}

#[async_trait]
impl TryOnClient for StubTryOnClient {
    async fn start_try_on(
        &self,
        _person_image: &[u8],
        _person_file_name: &str,
        _garment_image: &[u8],
        _garment_file_name: &str,
    ) -> Result<TryOnSubmission, ProviderError> {
        if self.fail_submission {
            return Err(ProviderError::Permanent {
                status: 400,
                body: "person image unusable".to_string(),
            });
        }
        Ok(TryOnSubmission {
            job_id: "tryon-1".to_string(),
            status_url: Some("http://tryon.test/status/tryon-1".to_string()),
        })
    }

    async fn get_status(&self, _try_on_job_id: &str) -> Result<TryOnStatus, ProviderError> {
        Ok(self.status.lock().unwrap().clone())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    pipeline: PipelineOrchestrator,
    jobs: Arc<InMemoryJobStore>,
    images: Arc<InMemoryImageStore>,
    generation: Arc<StubGenerativeClient>,
}

fn harness(generation: StubGenerativeClient, tryon: StubTryOnClient) -> Harness {
    let jobs = Arc::new(InMemoryJobStore::default());
    let images = Arc::new(InMemoryImageStore::default());
    let generation = Arc::new(generation);
    let pipeline = PipelineOrchestrator::new(
        jobs.clone(),
        images.clone(),
        generation.clone(),
        Arc::new(tryon),
        GenerationSettings {
            model: "sdxl-test".to_string(),
            size: 1024,
            steps: 20,
            guidance: 7.0,
        },
    );
    Harness {
        pipeline,
        jobs,
        images,
        generation,
    }
}

fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// Rank along the canonical pipeline chain; both intermediate generation
/// states share a rank since they are alternatives.
fn rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::PendingGeneration => 0,
        JobStatus::DesignGenerated | JobStatus::GarmentGenerated => 1,
        JobStatus::ProductImageGenerated => 2,
        JobStatus::TryOnStarted => 3,
        JobStatus::Completed => 4,
        JobStatus::Failed => 5,
    }
}

fn assert_forward_only(history: &[JobStatus]) {
    for pair in history.windows(2) {
        assert!(
            rank(pair[1]) >= rank(pair[0]),
            "status moved backward: {:?}",
            history
        );
        assert!(
            !pair[0].is_terminal() || pair[0] == pair[1],
            "status left a terminal state: {:?}",
            history
        );
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_design_generation_completes() {
    let h = harness(
        StubGenerativeClient::new(png(512, 512, [255, 0, 0, 255])),
        StubTryOnClient::processing(),
    );

    let outcome = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();

    assert!(!outcome.design_image_url.is_empty());
    let job = h.jobs.job(outcome.job_id);
    assert_eq!(job.status, JobStatus::DesignGenerated);
    assert_eq!(job.design_image_url.as_deref(), Some(outcome.design_image_url.as_str()));
    assert!(job.provider_request_id.is_some());
    assert!(job.last_error.is_none());
    assert_forward_only(&h.jobs.status_history(outcome.job_id));

    // The design bytes were re-hosted in the image store.
    let stored = h.images.download(&outcome.design_image_url).await.unwrap();
    assert!(!stored.is_empty());
}

#[tokio::test]
async fn scenario_b_apply_design_generates_product_image() {
    let h = harness(
        StubGenerativeClient::new(png(128, 128, [0, 0, 255, 255])),
        StubTryOnClient::processing(),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();

    // The provider's next render: the garment with a slight global shift.
    h.generation.set_asset(png(800, 800, [210, 40, 40, 255]));

    let garment = png(800, 800, [200, 30, 30, 255]);
    let outcome = h
        .pipeline
        .apply_design_to_garment("u1", design.job_id, garment)
        .await
        .unwrap();

    assert!(!outcome.final_product_image_url.is_empty());
    let job = h.jobs.job(outcome.job_id);
    assert_eq!(job.status, JobStatus::ProductImageGenerated);
    assert!(job.source_garment_path.is_some());
    assert_forward_only(&h.jobs.status_history(outcome.job_id));

    // Color recovery ran: the stored product keeps the garment dimensions.
    let stored = h
        .images
        .download(&outcome.final_product_image_url)
        .await
        .unwrap();
    let product = image::load_from_memory(&stored).unwrap();
    assert_eq!((product.width(), product.height()), (800, 800));
}

#[tokio::test]
async fn scenario_b_post_processing_failure_degrades_to_raw_result() {
    let h = harness(
        StubGenerativeClient::new(png(128, 128, [0, 0, 255, 255])),
        StubTryOnClient::processing(),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();

    // Provider returns bytes the compositor cannot decode: color recovery
    // fails, the raw result is shipped, the job still succeeds.
    h.generation.set_asset(b"not an image at all".to_vec());

    let garment = png(800, 800, [200, 30, 30, 255]);
    let outcome = h
        .pipeline
        .apply_design_to_garment("u1", design.job_id, garment)
        .await
        .unwrap();

    assert!(!outcome.final_product_image_url.is_empty());
    let job = h.jobs.job(outcome.job_id);
    assert_eq!(job.status, JobStatus::ProductImageGenerated);
    assert!(job.last_error.is_none());

    let stored = h
        .images
        .download(&outcome.final_product_image_url)
        .await
        .unwrap();
    assert_eq!(stored, b"not an image at all".to_vec());
}

#[tokio::test]
async fn scenario_c_try_on_without_finalized_garment_is_rejected() {
    let h = harness(
        StubGenerativeClient::new(png(128, 128, [0, 0, 255, 255])),
        StubTryOnClient::processing(),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();

    let err = h
        .pipeline
        .start_try_on("u1", design.job_id, png(400, 600, [9, 9, 9, 255]), "me.png")
        .await
        .unwrap_err();

    assert!(err.is_validation());
    // Validation failures are never persisted to the job.
    let job = h.jobs.job(design.job_id);
    assert_eq!(job.status, JobStatus::DesignGenerated);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn direct_garment_generation_passes_both_intermediate_states() {
    let h = harness(
        StubGenerativeClient::new(png(640, 640, [50, 60, 70, 255])),
        StubTryOnClient::processing(),
    );

    let garment = png(640, 640, [40, 50, 60, 255]);
    let outcome = h
        .pipeline
        .generate_garment_from_prompt("u1", "flame pattern", garment)
        .await
        .unwrap();

    let job = h.jobs.job(outcome.job_id);
    assert_eq!(job.status, JobStatus::ProductImageGenerated);
    assert!(job.generated_garment_url.is_some());
    assert!(job.final_product_image_url.is_some());

    let history = h.jobs.status_history(outcome.job_id);
    assert!(history.contains(&JobStatus::GarmentGenerated));
    assert_forward_only(&history);
}

#[tokio::test]
async fn full_pipeline_reaches_completed_through_try_on() {
    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::with_status(tryon_status(
            "completed",
            Some("http://tryon.test/results/out.png"),
            None,
        )),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();
    h.generation.set_asset(png(800, 800, [210, 40, 40, 255]));
    let product = h
        .pipeline
        .apply_design_to_garment("u1", design.job_id, png(800, 800, [200, 30, 30, 255]))
        .await
        .unwrap();

    let started = h
        .pipeline
        .start_try_on("u1", product.job_id, png(400, 600, [1, 2, 3, 255]), "me.png")
        .await
        .unwrap();
    assert_eq!(started.try_on_job_id, "tryon-1");
    assert_eq!(h.jobs.job(product.job_id).status, JobStatus::TryOnStarted);

    let status = h.pipeline.get_try_on_status("tryon-1").await.unwrap();
    assert!(status.is_completed());

    let job = h.jobs.job(product.job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.try_on_result_url.as_deref(),
        Some("http://tryon.test/results/out.png")
    );
    assert_forward_only(&h.jobs.status_history(product.job_id));
}

#[tokio::test]
async fn try_on_completion_with_base64_result_is_rehosted() {
    use base64::Engine;

    let pixels = png(64, 64, [7, 7, 7, 255]);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&pixels);
    let mut status = tryon_status("done", None, None);
    status.image_base64 = Some(encoded);

    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::with_status(status),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();
    h.generation.set_asset(png(800, 800, [210, 40, 40, 255]));
    let product = h
        .pipeline
        .apply_design_to_garment("u1", design.job_id, png(800, 800, [200, 30, 30, 255]))
        .await
        .unwrap();
    h.pipeline
        .start_try_on("u1", product.job_id, png(400, 600, [1, 2, 3, 255]), "me.png")
        .await
        .unwrap();

    h.pipeline.get_try_on_status("tryon-1").await.unwrap();

    let job = h.jobs.job(product.job_id);
    assert_eq!(job.status, JobStatus::Completed);
    let result_url = job.try_on_result_url.expect("result url should be set");
    assert_eq!(h.images.download(&result_url).await.unwrap(), pixels);
}

#[tokio::test]
async fn try_on_provider_failure_marks_job_failed() {
    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::with_status(tryon_status(
            "failed",
            None,
            Some("garment not detected"),
        )),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();
    h.generation.set_asset(png(800, 800, [210, 40, 40, 255]));
    let product = h
        .pipeline
        .apply_design_to_garment("u1", design.job_id, png(800, 800, [200, 30, 30, 255]))
        .await
        .unwrap();
    h.pipeline
        .start_try_on("u1", product.job_id, png(400, 600, [1, 2, 3, 255]), "me.png")
        .await
        .unwrap();

    // The status call itself succeeds; the failure is folded into the job.
    let status = h.pipeline.get_try_on_status("tryon-1").await.unwrap();
    assert!(status.is_failed());

    let job = h.jobs.job(product.job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("garment not detected"));
}

#[tokio::test]
async fn try_on_status_for_unknown_job_is_still_returned() {
    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::with_status(tryon_status(
            "completed",
            Some("http://tryon.test/results/out.png"),
            None,
        )),
    );

    // No job owns "tryon-1"; the lookup miss is logged, not fatal.
    let status = h.pipeline.get_try_on_status("tryon-1").await.unwrap();
    assert!(status.is_completed());
}

#[tokio::test]
async fn try_on_submission_failure_marks_job_failed_and_reraises() {
    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::failing_submission(),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();
    h.generation.set_asset(png(800, 800, [210, 40, 40, 255]));
    let product = h
        .pipeline
        .apply_design_to_garment("u1", design.job_id, png(800, 800, [200, 30, 30, 255]))
        .await
        .unwrap();

    let err = h
        .pipeline
        .start_try_on("u1", product.job_id, png(400, 600, [1, 2, 3, 255]), "me.png")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Provider(_)));

    let job = h.jobs.job(product.job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .last_error
        .as_deref()
        .is_some_and(|msg| msg.contains("person image unusable")));
}

#[tokio::test]
async fn generation_failure_marks_job_failed_and_reraises() {
    let h = harness(
        StubGenerativeClient::failing_poll(Vec::new()),
        StubTryOnClient::processing(),
    );

    let err = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Provider(_)));

    let jobs = h.jobs.jobs.lock().unwrap().clone();
    let job = jobs.values().next().expect("job should have been created");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.is_some());
}

#[tokio::test]
async fn cross_user_access_is_rejected_without_mutation() {
    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::processing(),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();

    let err = h
        .pipeline
        .apply_design_to_garment("u2", design.job_id, png(800, 800, [200, 30, 30, 255]))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = h
        .pipeline
        .job_status("u2", design.job_id)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert_eq!(h.jobs.job(design.job_id).status, JobStatus::DesignGenerated);
}

#[tokio::test]
async fn missing_inputs_are_validation_errors() {
    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::processing(),
    );

    assert!(h
        .pipeline
        .generate_design_from_prompt("", "dragon logo")
        .await
        .unwrap_err()
        .is_validation());
    assert!(h
        .pipeline
        .generate_design_from_prompt("u1", "   ")
        .await
        .unwrap_err()
        .is_validation());
    assert!(h
        .pipeline
        .generate_garment_from_prompt("u1", "flames", Vec::new())
        .await
        .unwrap_err()
        .is_validation());
    assert!(h
        .pipeline
        .apply_design_to_garment("u1", Uuid::new_v4(), png(10, 10, [0, 0, 0, 255]))
        .await
        .unwrap_err()
        .is_validation());

    // No jobs were created by any of the rejected calls.
    assert!(h.jobs.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stale_writes_are_rejected() {
    let h = harness(
        StubGenerativeClient::new(png(256, 256, [10, 10, 10, 255])),
        StubTryOnClient::processing(),
    );

    let design = h
        .pipeline
        .generate_design_from_prompt("u1", "dragon logo")
        .await
        .unwrap();

    let mut first = h.jobs.job(design.job_id);
    let mut second = first.clone();

    first.prompt = "updated".to_string();
    h.jobs.update(&mut first).await.unwrap();

    let err = h.jobs.update(&mut second).await.unwrap_err();
    assert!(matches!(err, StoreError::StaleWrite(id) if id == design.job_id));
}
