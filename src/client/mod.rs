//! Streaming inference client.
//!
//! Speaks the server's HTTP API: streamed chat and model pulls as line-delimited
//! JSON, single-shot embeddings, and a model-inventory health check. Every
//! request goes through [`RetryPolicy`]; only transient failures are retried.
//! The client keeps no per-request state, so one instance can serve any number
//! of concurrent calls.

pub mod ndjson;
pub mod retry;
pub mod types;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{ServiceError, ServiceResult};
pub use ndjson::NdjsonStream;
pub use retry::RetryPolicy;
pub use types::{
    ChatChunk, ChatExchange, ChatMessage, ChatRole, HealthReport, PullProgress,
};
use types::{
    model_matches, ChatOptions, ChatRequest, EmbeddingRequest, EmbeddingResponse, PullRequest,
    TagsResponse,
};

pub type ChatStream = NdjsonStream<ChatChunk>;
pub type PullStream = NdjsonStream<PullProgress>;

/// Anything that can answer a chat exchange with a single block of text.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, exchange: &ChatExchange) -> anyhow::Result<String>;
}

pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    retry: RetryPolicy,
    health_cache_window: Duration,
    health_cache: Mutex<Option<(Instant, HealthReport)>>,
}

impl InferenceClient {
    pub fn new(config: &ClientConfig) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            // a read timeout, not a total one: streams may legitimately run for minutes
            .read_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::ConnectionFailed(format!("failed to build HTTP client: {e}")))?;

        let base_url = config.base_url.as_deref().ok_or_else(|| {
            ServiceError::ConnectionFailed("no inference server address configured".into())
        })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            retry: RetryPolicy::from(&config.retry),
            health_cache_window: Duration::from_millis(config.health_cache_ms),
            health_cache: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    /// Stream a chat response. Chunks arrive in server order; the last one
    /// has `is_final` set unless the connection closed early.
    pub async fn chat(&self, exchange: &ChatExchange) -> ServiceResult<ChatStream> {
        let request = &ChatRequest {
            model: &self.chat_model,
            messages: &exchange.messages,
            stream: true,
            options: exchange.temperature.map(|temperature| ChatOptions { temperature }),
        };
        debug!(
            model = %self.chat_model,
            messages = exchange.messages.len(),
            "opening chat stream"
        );

        let response = self
            .retry
            .run("chat", || self.post_json("/api/chat", request, &self.chat_model))
            .await?;
        Ok(NdjsonStream::spawn(response, ChatChunk::from_line, |c| c.is_final))
    }

    /// Download `name`, reporting progress until the server says `success`.
    pub async fn pull_model(&self, name: &str) -> ServiceResult<PullStream> {
        let request = &PullRequest { name, stream: true };
        info!(model = name, "pulling model");

        let response = self
            .retry
            .run("pull", || self.post_json("/api/pull", request, name))
            .await?;
        Ok(NdjsonStream::spawn(response, PullProgress::from_line, |p| p.is_complete()))
    }

    pub async fn generate_embedding(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let request = &EmbeddingRequest {
            model: &self.embedding_model,
            prompt: text,
        };

        let response = self
            .retry
            .run("embeddings", || async move {
                let response = self
                    .post_json("/api/embeddings", request, &self.embedding_model)
                    .await?;
                response
                    .json::<EmbeddingResponse>()
                    .await
                    .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
            })
            .await?;

        if response.embedding.is_empty() {
            return Err(ServiceError::InvalidResponse(
                "server returned an empty embedding".into(),
            ));
        }
        Ok(response.embedding)
    }

    /// List installed models and check that the chat model is among them.
    ///
    /// The result is cached briefly so a polling UI does not hammer the server.
    /// An unreachable server reports `ready: false` rather than an error.
    pub async fn check_health(&self) -> HealthReport {
        if let Some(report) = self.cached_health() {
            return report;
        }

        let report = match self.list_models().await {
            Ok(models) => HealthReport {
                ready: models.iter().any(|m| model_matches(m, &self.chat_model)),
                models,
            },
            Err(e) => {
                debug!(error = %e, "health check failed");
                HealthReport {
                    ready: false,
                    models: Vec::new(),
                }
            }
        };

        if let Ok(mut cache) = self.health_cache.lock() {
            *cache = Some((Instant::now(), report.clone()));
        }
        report
    }

    /// Drop the cached health result so the next check probes the server.
    pub fn invalidate_health(&self) {
        if let Ok(mut cache) = self.health_cache.lock() {
            *cache = None;
        }
    }

    pub async fn list_models(&self) -> ServiceResult<Vec<String>> {
        let url = &format!("{}/api/tags", self.base_url);
        let tags: TagsResponse = self
            .retry
            .run("tags", || async move {
                let response = self.http.get(url.as_str()).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(match retry::classify_status(status, &body, &self.chat_model) {
                        // a missing tags endpoint says nothing about any model
                        ServiceError::ModelNotFound(_) => {
                            ServiceError::InvalidResponse(format!("{url} returned 404"))
                        }
                        other => other,
                    });
                }
                response
                    .json::<TagsResponse>()
                    .await
                    .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
            })
            .await?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| if m.name.is_empty() { m.model.unwrap_or_default() } else { m.name })
            .filter(|name| !name.is_empty())
            .collect())
    }

    pub async fn has_model(&self, name: &str) -> ServiceResult<bool> {
        Ok(self.list_models().await?.iter().any(|m| model_matches(m, name)))
    }

    fn cached_health(&self) -> Option<HealthReport> {
        let cache = self.health_cache.lock().ok()?;
        match cache.as_ref() {
            Some((at, report)) if at.elapsed() < self.health_cache_window => Some(report.clone()),
            _ => None,
        }
    }

    /// POST a JSON body and classify the status before anything reads the body.
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        model: &str,
    ) -> ServiceResult<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(retry::classify_status(status, &text, model))
    }

    /// Drain a chat stream into one string.
    pub async fn complete_text(&self, exchange: &ChatExchange) -> ServiceResult<String> {
        let mut stream = self.chat(exchange).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            text.push_str(&chunk.content);
            if chunk.is_final {
                break;
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl ChatCompletion for InferenceClient {
    async fn complete(&self, exchange: &ChatExchange) -> anyhow::Result<String> {
        Ok(self.complete_text(exchange).await?)
    }
}

#[async_trait]
impl EmbeddingProvider for InferenceClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.generate_embedding(text).await?)
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}
