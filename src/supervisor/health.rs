//! Health probing for the supervised server.
//!
//! The server's own health endpoint answers with
//! `{"status": "healthy"|"loading", "model_loaded": bool, "download_progress": f64}`,
//! where a negative progress means the model failed to load. Servers without
//! that endpoint (404) are checked through the model-list endpoint instead.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::SupervisorConfig;
use crate::error::{ServiceError, ServiceResult};

/// What one probe of the service port found.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Nothing answered.
    Unreachable,
    /// Answered and the model is loaded.
    Healthy,
    /// Answered, model not loaded yet. `progress` is set while weights download.
    Loading { progress: Option<f64> },
    /// Answered and reported that the model could not be loaded.
    Failed(String),
    /// Something answered but does not speak the health contract.
    Foreign,
}

impl ProbeOutcome {
    /// Whether a compatible server is listening, ready or not.
    pub fn is_compatible(&self) -> bool {
        matches!(self, Self::Healthy | Self::Loading { .. } | Self::Failed(_))
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

#[derive(Debug, Deserialize)]
struct HealthPayload {
    status: String,
    #[serde(default)]
    model_loaded: bool,
    #[serde(default)]
    download_progress: Option<f64>,
}

/// Interpret a health endpoint body.
pub fn parse_health_payload(body: &str) -> ProbeOutcome {
    let payload: HealthPayload = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(_) => return ProbeOutcome::Foreign,
    };

    if let Some(progress) = payload.download_progress {
        if progress < 0.0 {
            return ProbeOutcome::Failed("the server reported that the model failed to load".into());
        }
    }

    match payload.status.as_str() {
        "healthy" | "ready" if payload.model_loaded || payload.download_progress.is_none() => {
            ProbeOutcome::Healthy
        }
        "healthy" | "ready" | "loading" => ProbeOutcome::Loading {
            // 0 and 1 are "not started" and "finishing up", not a download in progress
            progress: payload
                .download_progress
                .filter(|p| *p > 0.0 && *p < 1.0),
        },
        _ => ProbeOutcome::Foreign,
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    models: Vec<serde_json::Value>,
}

/// Probes `GET {health_path}` with a short timeout, falling back to the model list.
pub struct HttpHealthProbe {
    http: reqwest::Client,
    health_url: String,
    models_url: String,
}

impl HttpHealthProbe {
    pub fn new(config: &SupervisorConfig) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| ServiceError::ConnectionFailed(format!("failed to build HTTP client: {e}")))?;
        let base = config.base_url();
        Ok(Self {
            http,
            health_url: format!("{base}{}", config.health_path),
            models_url: format!("{base}{}", config.models_path),
        })
    }

    async fn probe_model_list(&self) -> ProbeOutcome {
        let response = match self.http.get(&self.models_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %self.models_url, error = %e, "model list probe failed");
                return ProbeOutcome::Unreachable;
            }
        };
        if !response.status().is_success() {
            return ProbeOutcome::Foreign;
        }
        match response.json::<ModelList>().await {
            Ok(_) => ProbeOutcome::Healthy,
            Err(_) => ProbeOutcome::Foreign,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> ProbeOutcome {
        let response = match self.http.get(&self.health_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %self.health_url, error = %e, "health probe failed");
                return ProbeOutcome::Unreachable;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return self.probe_model_list().await;
        }

        // a 503 may still carry the structured payload while the model loads
        let body = response.text().await.unwrap_or_default();
        parse_health_payload(&body)
    }
}

/// Remembers the last probe result for a fixed window so a polling caller
/// collapses into one real probe.
#[derive(Debug)]
pub struct HealthCache {
    window: Duration,
    last: Option<(Instant, ProbeOutcome)>,
}

impl HealthCache {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn get(&self) -> Option<&ProbeOutcome> {
        match &self.last {
            Some((at, outcome)) if at.elapsed() < self.window => Some(outcome),
            _ => None,
        }
    }

    pub fn put(&mut self, outcome: ProbeOutcome) {
        self.last = Some((Instant::now(), outcome));
    }

    pub fn invalidate(&mut self) {
        self.last = None;
    }
}
