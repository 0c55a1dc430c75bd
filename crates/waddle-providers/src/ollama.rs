use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};
use waddle_core::types::ProviderKind;

use crate::db::ProviderLink;
use crate::openai::connect_to_unavailable;
use crate::provider::{
    ChatMessage, ChatOptions, ChatOutcome, HealthStatus, ModelDescriptor, ProviderError,
    ProviderHandle, RawUsage,
};

/// Handle for Ollama-compatible local backends. The only kind with model
/// lifecycle management (pull/remove).
pub struct OllamaHandle {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaHandle {
    pub fn new(link: &ProviderLink) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: link.endpoint_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ProviderHandle for OllamaHandle {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        let body = build_request_body(messages, model, options);
        let url = format!("{}/api/chat", self.base_url);

        debug!(model, "sending request to Ollama");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(connect_to_unavailable)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Ollama API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(connect_to_unavailable)?;
        if !resp.status().is_success() {
            return Err(ProviderError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelDescriptor {
                id: m.name,
                provider: ProviderKind::Ollama,
                created: 0,
                owned_by: "ollama".to_string(),
                context_length: 4096,
            })
            .collect())
    }

    async fn health(&self) -> HealthStatus {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => HealthStatus {
                healthy: true,
                detail: "ok".to_string(),
            },
            Ok(resp) => HealthStatus {
                healthy: false,
                detail: format!("status {}", resp.status().as_u16()),
            },
            Err(e) => HealthStatus {
                healthy: false,
                detail: e.to_string(),
            },
        }
    }

    async fn pull_model(&self, model: &str) -> Result<(), ProviderError> {
        let url = format!("{}/api/pull", self.base_url);
        info!(model, "pulling Ollama model");
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "name": model, "stream": false }))
            .send()
            .await
            .map_err(connect_to_unavailable)?;
        if !resp.status().is_success() {
            return Err(ProviderError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn remove_model(&self, model: &str) -> Result<(), ProviderError> {
        let url = format!("{}/api/delete", self.base_url);
        info!(model, "removing Ollama model");
        let resp = self
            .client
            .delete(&url)
            .json(&serde_json::json!({ "name": model }))
            .send()
            .await
            .map_err(connect_to_unavailable)?;
        if !resp.status().is_success() {
            return Err(ProviderError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn build_request_body(
    messages: &[ChatMessage],
    model: &str,
    options: &ChatOptions,
) -> serde_json::Value {
    // Ollama uses the OpenAI-style messages array; generation options sit
    // under "options".
    let msgs: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut opts = serde_json::Map::new();
    if let Some(max_tokens) = options.max_tokens {
        opts.insert("num_predict".to_string(), serde_json::json!(max_tokens));
    }
    if let Some(temperature) = options.temperature {
        opts.insert("temperature".to_string(), serde_json::json!(temperature));
    }

    let mut body = serde_json::json!({
        "model": model,
        "messages": msgs,
        "stream": false,
        "options": opts,
    });
    for (key, value) in &options.extra {
        body[key] = value.clone();
    }
    body
}

fn parse_response(resp: ApiResponse) -> ChatOutcome {
    ChatOutcome {
        text: resp.message.content,
        usage: RawUsage {
            input_tokens: resp.prompt_eval_count,
            output_tokens: resp.eval_count,
        },
        finish_reason: if resp.done {
            resp.done_reason.unwrap_or_else(|| "stop".to_string())
        } else {
            String::new()
        },
        model: resp.model,
    }
}

// Ollama API response types (deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    message: OllamaMessage,
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MessageRole;

    #[test]
    fn request_body_maps_max_tokens_to_num_predict() {
        let messages = vec![ChatMessage {
            role: MessageRole::User,
            content: "hi".into(),
        }];
        let options = ChatOptions {
            max_tokens: Some(128),
            temperature: Some(0.2),
            ..Default::default()
        };
        let body = build_request_body(&messages, "llama2", &options);
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["temperature"], 0.2);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn parse_response_reads_eval_counts() {
        let resp: ApiResponse = serde_json::from_value(serde_json::json!({
            "model": "llama2",
            "message": {"role": "assistant", "content": "hello"},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 20,
            "eval_count": 6
        }))
        .unwrap();
        let outcome = parse_response(resp);
        assert_eq!(outcome.text, "hello");
        assert_eq!(outcome.usage.input_tokens, Some(20));
        assert_eq!(outcome.usage.output_tokens, Some(6));
        assert_eq!(outcome.finish_reason, "stop");
    }

    #[test]
    fn missing_eval_counts_leave_usage_unreported() {
        let resp: ApiResponse = serde_json::from_value(serde_json::json!({
            "model": "llama2",
            "message": {"content": "hi"},
            "done": true
        }))
        .unwrap();
        let outcome = parse_response(resp);
        assert!(outcome.usage.input_tokens.is_none());
        assert!(outcome.usage.output_tokens.is_none());
    }
}
