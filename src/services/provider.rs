//! Shared plumbing for the generative-image and try-on provider adapters:
//! error taxonomy, transient classification of HTTP responses, and the
//! bounded exponential-backoff retry loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Extra attempts after the first failed call.
pub const MAX_EXTRA_ATTEMPTS: u32 = 2;

/// Base backoff delay; attempt `n` waits `500ms * 2^n`.
pub const BACKOFF_BASE_MS: u64 = 500;

/// Upper bound on response-body excerpts embedded in error messages.
const BODY_EXCERPT_CHARS: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned transient status {status}: {message}")]
    Transient { status: u16, message: String },

    #[error("provider request failed with status {status}: {body}")]
    Permanent { status: u16, body: String },

    #[error("provider did not reach a terminal state within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("provider reported completion without a result URL")]
    MissingResult,

    #[error("provider reported failure: {0}")]
    Failed(String),

    #[error("provider response could not be parsed: {0}")]
    Malformed(String),

    #[error("provider request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// Map an HTTP response to the provider error taxonomy.
///
/// 429 and 5xx are transient (retryable); any other non-success status is
/// permanent and carries the status code plus a truncated body excerpt.
pub async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    let body = truncate_body(&body);

    if code == 429 || status.is_server_error() {
        Err(ProviderError::Transient {
            status: code,
            message: body,
        })
    } else {
        Err(ProviderError::Permanent {
            status: code,
            body,
        })
    }
}

/// Run `call`, retrying transient failures up to [`MAX_EXTRA_ATTEMPTS`]
/// times with exponential backoff. A transient error that survives all
/// retries escalates to a permanent one.
pub async fn with_retries<T, F, Fut>(operation: &str, mut call: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_EXTRA_ATTEMPTS => {
                let delay = Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt));
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient provider error, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(ProviderError::Transient { status, message }) => {
                return Err(ProviderError::Permanent {
                    status,
                    body: format!(
                        "still failing after {} attempts: {}",
                        MAX_EXTRA_ATTEMPTS + 1,
                        message
                    ),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

fn truncate_body(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}
