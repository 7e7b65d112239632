use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{pipeline::PipelineOrchestrator, rate_limit::RateLimiter};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub pipeline: Arc<PipelineOrchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(db: PgPool, pipeline: PipelineOrchestrator, rate_limiter: RateLimiter) -> Self {
        Self {
            db,
            pipeline: Arc::new(pipeline),
            rate_limiter: Arc::new(rate_limiter),
        }
    }
}
