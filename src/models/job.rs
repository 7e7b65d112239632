use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a customization job as it moves through the pipeline.
///
/// The graph is forward-only: `PendingGeneration` forks into the standalone
/// design path or the direct garment path, both converge on
/// `ProductImageGenerated`, and try-on finishes the job. `Completed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    PendingGeneration,
    DesignGenerated,
    GarmentGenerated,
    ProductImageGenerated,
    TryOnStarted,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether this status accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// `Failed` is reachable from any non-terminal state; everything else
    /// must follow the pipeline graph.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (PendingGeneration, DesignGenerated)
                | (PendingGeneration, GarmentGenerated)
                | (DesignGenerated, ProductImageGenerated)
                | (GarmentGenerated, ProductImageGenerated)
                | (ProductImageGenerated, TryOnStarted)
                | (TryOnStarted, Completed)
        )
    }
}

/// A single user's customization request tracked end-to-end.
///
/// Plain value object: holds the owning `user_id` as a key, never a live
/// user reference. `version` is the optimistic concurrency counter bumped
/// by every successful store update; stale writes are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomizationJob {
    pub id: Uuid,
    pub user_id: String,
    pub prompt: String,
    pub source_garment_path: Option<String>,
    pub design_image_url: Option<String>,
    pub generated_garment_url: Option<String>,
    pub final_product_image_url: Option<String>,
    pub provider_request_id: Option<String>,
    pub try_on_job_id: Option<String>,
    pub try_on_status_url: Option<String>,
    pub try_on_result_url: Option<String>,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl CustomizationJob {
    /// Create a fresh job for `user_id` in `PendingGeneration`.
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            prompt: prompt.into(),
            source_garment_path: None,
            design_image_url: None,
            generated_garment_url: None,
            final_product_image_url: None,
            provider_request_id: None,
            try_on_job_id: None,
            try_on_status_url: None,
            try_on_result_url: None,
            status: JobStatus::PendingGeneration,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Advance the job to `next`, enforcing the forward-only graph.
    pub fn advance_to(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the job failed with a human-readable reason.
    ///
    /// A no-op on terminal jobs: a job never leaves `Failed` or `Completed`.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.last_error = Some(reason.into());
    }

    /// Whether `user_id` owns this job.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}
