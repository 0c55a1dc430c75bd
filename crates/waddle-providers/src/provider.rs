use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use waddle_core::types::ProviderKind;

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Options forwarded upstream. Known fields are typed; everything else
/// the client sent rides along in `extra` and is re-serialized verbatim
/// into the upstream request body.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Raw token usage as reported by the upstream. `None` means the backend
/// did not report that side; the accountant estimates instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// A completed upstream chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: RawUsage,
    pub finish_reason: String,
    /// Model name the upstream reports, which may differ from the alias
    /// the client requested.
    pub model: String,
}

/// One entry in the `/v1/models` union.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: ProviderKind,
    pub created: i64,
    pub owned_by: String,
    pub context_length: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub detail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream call timed out")]
    Timeout,

    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Whether the router should try the next candidate after this error.
    ///
    /// Upstream auth failures and model-not-found are the request's (or
    /// the operator's) problem, not the link's; retrying them elsewhere
    /// only burns the failover budget.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            ProviderError::Api {
                status: 401 | 403 | 404,
                ..
            } | ProviderError::Unsupported(_)
        )
    }
}

/// Typed handle to one upstream backend instance.
///
/// One handle exists per enabled provider link; the registry rebuilds the
/// handle set when links change.
#[async_trait]
pub trait ProviderHandle: Send + Sync {
    /// Provider kind this handle speaks.
    fn kind(&self) -> ProviderKind;

    /// Send a chat request and wait for the full response.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError>;

    /// Local token estimate for admission checks. Deterministic; never
    /// calls the network.
    fn count_tokens(&self, text: &str, _model: &str) -> u64 {
        waddle_ledger::estimate::estimate_tokens(text)
    }

    /// Models this backend offers.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError>;

    /// Cheap liveness probe against the backend.
    async fn health(&self) -> HealthStatus;

    /// Pull a model onto the backend. Ollama-kind only.
    async fn pull_model(&self, model: &str) -> Result<(), ProviderError> {
        let _ = model;
        Err(ProviderError::Unsupported("pull_model".to_string()))
    }

    /// Remove a model from the backend. Ollama-kind only.
    async fn remove_model(&self, model: &str) -> Result<(), ProviderError> {
        let _ = model;
        Err(ProviderError::Unsupported("remove_model".to_string()))
    }
}

/// Split messages into (system prompt, conversation) the way the
/// Anthropic dialect needs; system turns are concatenated in order.
pub(crate) fn split_system(messages: &[ChatMessage]) -> (String, Vec<&ChatMessage>) {
    let mut system = String::new();
    let mut rest = Vec::new();
    for m in messages {
        match m.role {
            MessageRole::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&m.content);
            }
            _ => rest.push(m),
        }
    }
    (system, rest)
}
