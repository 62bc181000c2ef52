//! Application-level chat types and the JSON shapes exchanged with the server.

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// An ordered conversation sent as a single chat request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatExchange {
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature; the server default applies when `None`.
    pub temperature: Option<f32>,
}

impl ChatExchange {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// One incremental piece of a streamed chat response.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatChunk {
    pub content: String,
    pub is_final: bool,
}

/// Download progress for a model pull. `progress` is in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PullProgress {
    pub progress: f64,
    pub status: String,
}

impl PullProgress {
    /// The server reports `"success"` once the model is fully installed.
    pub fn is_complete(&self) -> bool {
        self.status == PULL_SUCCESS_STATUS
    }
}

pub(crate) const PULL_SUCCESS_STATUS: &str = "success";

/// Result of the client-side health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// `true` when the server answered and the required model is installed.
    pub ready: bool,
    pub models: Vec<String>,
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatOptions {
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

impl ChatChunk {
    /// Decode one NDJSON line of a chat stream.
    pub fn from_line(line: &str) -> ServiceResult<Self> {
        let parsed: ChatLine = serde_json::from_str(line)?;
        if let Some(error) = parsed.error {
            return Err(ServiceError::InvalidResponse(error));
        }
        Ok(Self {
            content: parsed.message.map(|m| m.content).unwrap_or_default(),
            is_final: parsed.done,
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PullRequest<'a> {
    pub name: &'a str,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct PullLine {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl PullProgress {
    /// Decode one NDJSON line of a pull stream.
    pub fn from_line(line: &str) -> ServiceResult<Self> {
        let parsed: PullLine = serde_json::from_str(line)?;
        if let Some(error) = parsed.error {
            return Err(ServiceError::InvalidResponse(error));
        }
        let progress = match (parsed.completed, parsed.total) {
            (Some(completed), Some(total)) if total > 0 => {
                (completed as f64 / total as f64).clamp(0.0, 1.0)
            }
            _ if parsed.status == PULL_SUCCESS_STATUS => 1.0,
            _ => 0.0,
        };
        Ok(Self {
            progress,
            status: parsed.status,
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingResponse {
    #[serde(default)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Served models may carry a version suffix (`gemma3n:e2b`), so a required
/// name matches either exactly or by its family prefix before the `:`.
pub fn model_matches(installed: &str, required: &str) -> bool {
    if installed == required {
        return true;
    }
    let family = |name: &str| name.split(':').next().unwrap_or(name).to_string();
    family(installed) == family(required)
}
