use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Generative image provider base URL (txt2img/img2img + status polling)
    pub generation_base_url: String,

    /// Generative image provider API key
    pub generation_api_key: String,

    /// Model identifier passed to the generative provider
    #[serde(default = "default_generation_model")]
    pub generation_model: String,

    /// Requested output resolution for text-to-image (square)
    #[serde(default = "default_generation_size")]
    pub generation_size: u32,

    /// Diffusion steps per generation request
    #[serde(default = "default_generation_steps")]
    pub generation_steps: u32,

    /// Guidance scale for text-to-image requests
    #[serde(default = "default_generation_guidance")]
    pub generation_guidance: f64,

    /// Virtual try-on provider base URL
    pub tryon_base_url: String,

    /// Virtual try-on provider API key
    pub tryon_api_key: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Public base URL under which stored images are served
    pub public_image_base_url: String,

    /// Rate limit window length in seconds
    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: u64,

    /// Maximum requests per user per window
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_generation_model() -> String {
    "sdxl-base-1.0".to_string()
}

fn default_generation_size() -> u32 {
    1024
}

fn default_generation_steps() -> u32 {
    30
}

fn default_generation_guidance() -> f64 {
    7.5
}

fn default_rate_limit_window_seconds() -> u64 {
    60
}

fn default_rate_limit_max_requests() -> u32 {
    10
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
