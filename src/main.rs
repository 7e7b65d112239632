mod app_state;
mod config;
mod db;
mod models;
mod routes;
mod services;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use db::jobs::PgJobStore;
use services::{
    generation::HttpGenerativeClient,
    pipeline::{GenerationSettings, PipelineOrchestrator},
    rate_limit::RateLimiter,
    storage::R2ImageStore,
    tryon::HttpTryOnClient,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing printfit server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "customization_jobs_total",
        "Total customization jobs created"
    );
    metrics::describe_counter!(
        "customization_jobs_completed",
        "Total customization jobs completed via try-on"
    );
    metrics::describe_counter!(
        "customization_jobs_failed",
        "Total customization jobs that failed"
    );
    metrics::describe_counter!(
        "tryon_submissions_total",
        "Total virtual try-on submissions"
    );
    metrics::describe_counter!(
        "customization_post_process_failures",
        "Color-recovery post-processing failures (non-fatal)"
    );
    metrics::describe_counter!(
        "rate_limited_requests_total",
        "Requests rejected by the per-user rate limiter"
    );
    metrics::describe_histogram!(
        "customization_stage_seconds",
        "Time spent in a pipeline stage, including provider polling"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize R2 image store
    tracing::info!("Initializing R2 image store");
    let image_store = R2ImageStore::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
        &config.public_image_base_url,
    )
    .expect("Failed to initialize R2 image store");

    // Initialize provider clients
    tracing::info!("Initializing generative image client");
    let generation_client =
        HttpGenerativeClient::new(&config.generation_base_url, &config.generation_api_key)
            .expect("Failed to initialize generative image client");

    tracing::info!("Initializing try-on client");
    let tryon_client = HttpTryOnClient::new(&config.tryon_base_url, &config.tryon_api_key)
        .expect("Failed to initialize try-on client");

    // Assemble the pipeline orchestrator
    let pipeline = PipelineOrchestrator::new(
        Arc::new(PgJobStore::new(db_pool.clone())),
        Arc::new(image_store),
        Arc::new(generation_client),
        Arc::new(tryon_client),
        GenerationSettings {
            model: config.generation_model.clone(),
            size: config.generation_size,
            steps: config.generation_steps,
            guidance: config.generation_guidance,
        },
    );

    let rate_limiter = RateLimiter::new(
        config.rate_limit_window_seconds,
        config.rate_limit_max_requests,
    );

    // Create shared application state
    let state = AppState::new(db_pool, pipeline, rate_limiter);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/customizations/design",
            post(routes::customize::generate_design),
        )
        .route(
            "/api/v1/customizations/garment",
            post(routes::customize::generate_garment),
        )
        .route(
            "/api/v1/customizations/{job_id}/apply",
            post(routes::customize::apply_design),
        )
        .route(
            "/api/v1/customizations/{job_id}/tryon",
            post(routes::customize::start_try_on),
        )
        .route(
            "/api/v1/customizations/{job_id}",
            get(routes::customize::get_job_status),
        )
        .route(
            "/api/v1/tryon/status/{try_on_job_id}",
            get(routes::customize::get_try_on_status),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(8 * 1024 * 1024)); // 8 MB upload limit

    tracing::info!("Starting printfit on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
