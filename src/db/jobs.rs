use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{CustomizationJob, JobStatus};

/// Repository for customization jobs.
///
/// Updates are optimistic: the caller's `version` must match the stored
/// row, and a successful write bumps it. A mismatch is a rejected stale
/// write, never a silent overwrite.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn add(&self, job: CustomizationJob) -> Result<CustomizationJob, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<CustomizationJob>, StoreError>;

    async fn find_by_try_on_job_id(
        &self,
        try_on_job_id: &str,
    ) -> Result<Option<CustomizationJob>, StoreError>;

    async fn update(&self, job: &mut CustomizationJob) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("stale write rejected for job {0}: version conflict")]
    StaleWrite(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// PostgreSQL-backed job store.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "id, user_id, prompt, source_garment_path, design_image_url, \
     generated_garment_url, final_product_image_url, provider_request_id, try_on_job_id, \
     try_on_status_url, try_on_result_url, status, last_error, created_at, updated_at, version";

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<CustomizationJob, sqlx::Error> {
    let status_text: String = row.try_get("status")?;
    let status =
        JobStatus::from_str(&status_text).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(CustomizationJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        prompt: row.try_get("prompt")?,
        source_garment_path: row.try_get("source_garment_path")?,
        design_image_url: row.try_get("design_image_url")?,
        generated_garment_url: row.try_get("generated_garment_url")?,
        final_product_image_url: row.try_get("final_product_image_url")?,
        provider_request_id: row.try_get("provider_request_id")?,
        try_on_job_id: row.try_get("try_on_job_id")?,
        try_on_status_url: row.try_get("try_on_status_url")?,
        try_on_result_url: row.try_get("try_on_result_url")?,
        status,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn add(&self, job: CustomizationJob) -> Result<CustomizationJob, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO customization_jobs
                (id, user_id, prompt, source_garment_path, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(job.id)
        .bind(&job.user_id)
        .bind(&job.prompt)
        .bind(&job.source_garment_path)
        .bind(job.status.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(job_from_row(&row)?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CustomizationJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM customization_jobs WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    async fn find_by_try_on_job_id(
        &self,
        try_on_job_id: &str,
    ) -> Result<Option<CustomizationJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM customization_jobs WHERE try_on_job_id = $1",
        ))
        .bind(try_on_job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    async fn update(&self, job: &mut CustomizationJob) -> Result<(), StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE customization_jobs
            SET source_garment_path = $1,
                design_image_url = $2,
                generated_garment_url = $3,
                final_product_image_url = $4,
                provider_request_id = $5,
                try_on_job_id = $6,
                try_on_status_url = $7,
                try_on_result_url = $8,
                status = $9,
                last_error = $10,
                updated_at = NOW(),
                version = version + 1
            WHERE id = $11 AND version = $12
            RETURNING updated_at, version
            "#,
        )
        .bind(&job.source_garment_path)
        .bind(&job.design_image_url)
        .bind(&job.generated_garment_url)
        .bind(&job.final_product_image_url)
        .bind(&job.provider_request_id)
        .bind(&job.try_on_job_id)
        .bind(&job.try_on_status_url)
        .bind(&job.try_on_result_url)
        .bind(job.status.to_string())
        .bind(&job.last_error)
        .bind(job.id)
        .bind(job.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                job.updated_at = row.try_get("updated_at")?;
                job.version = row.try_get("version")?;
                Ok(())
            }
            None => {
                let exists = sqlx::query("SELECT 1 FROM customization_jobs WHERE id = $1")
                    .bind(job.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .is_some();
                if exists {
                    Err(StoreError::StaleWrite(job.id))
                } else {
                    Err(StoreError::NotFound(job.id))
                }
            }
        }
    }
}
