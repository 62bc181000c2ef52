use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ServiceError, ServiceResult};

/// Exponential backoff: the delay doubles from `base_delay` after every failed attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !e.is_retryable() {
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        request = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Map a non-success HTTP status to the error taxonomy.
///
/// `model` names the model the request needed, so a 404 can say which one is missing.
pub fn classify_status(status: reqwest::StatusCode, body: &str, model: &str) -> ServiceError {
    let message = extract_error_message(body);
    match status.as_u16() {
        404 => ServiceError::ModelNotFound(model.to_string()),
        401 | 403 => ServiceError::PermissionDenied(message),
        s if s >= 500 => ServiceError::ServerError { status: s, message },
        s => ServiceError::InvalidResponse(format!("HTTP {s}: {message}")),
    }
}

/// Servers report failures as `{"error": "..."}`; fall back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string())
}
