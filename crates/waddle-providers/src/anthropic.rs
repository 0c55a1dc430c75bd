use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use waddle_core::types::ProviderKind;

use crate::db::ProviderLink;
use crate::openai::{advertised_descriptors, connect_to_unavailable};
use crate::provider::{
    split_system, ChatMessage, ChatOptions, ChatOutcome, HealthStatus, ModelDescriptor,
    ProviderError, ProviderHandle, RawUsage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The messages API requires max_tokens; used when the client sends none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Handle for Anthropic-compatible backends (messages API dialect).
pub struct AnthropicHandle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    advertised: Vec<String>,
}

impl AnthropicHandle {
    pub fn new(link: &ProviderLink) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: link.endpoint_url.trim_end_matches('/').to_string(),
            api_key: link.api_key.clone().unwrap_or_default(),
            advertised: link.model_list.clone(),
        }
    }
}

#[async_trait]
impl ProviderHandle for AnthropicHandle {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        let body = build_request_body(messages, model, options);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model, "sending request to Anthropic-compatible backend");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(connect_to_unavailable)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
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
        // The messages API has no model listing; the link's advertised
        // set is the source of truth.
        Ok(advertised_descriptors(
            &self.advertised,
            ProviderKind::Anthropic,
            "anthropic",
        ))
    }

    async fn health(&self) -> HealthStatus {
        // A deliberately malformed request still proves the endpoint is
        // up and the key is valid enough to be parsed.
        let url = format!("{}/v1/messages", self.base_url);
        let probe = serde_json::json!({
            "model": self.advertised.first().cloned().unwrap_or_else(|| "claude-3-sonnet".to_string()),
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        match self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&probe)
            .send()
            .await
        {
            Ok(resp) if resp.status().as_u16() < 500 => HealthStatus {
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
}

fn build_request_body(
    messages: &[ChatMessage],
    model: &str,
    options: &ChatOptions,
) -> serde_json::Value {
    // Anthropic takes the system prompt as a top-level field, not a
    // message role.
    let (system, conversation) = split_system(messages);
    let msgs: Vec<serde_json::Value> = conversation
        .iter()
        .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": msgs,
    });
    if !system.is_empty() {
        body["system"] = serde_json::json!(system);
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    for (key, value) in &options.extra {
        body[key] = value.clone();
    }
    body
}

fn parse_response(resp: ApiResponse) -> ChatOutcome {
    let text: String = resp
        .content
        .iter()
        .filter_map(|block| {
            if block.block_type == "text" {
                block.text.as_deref()
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("");

    ChatOutcome {
        text,
        usage: RawUsage {
            input_tokens: resp.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: resp.usage.as_ref().map(|u| u.output_tokens),
        },
        finish_reason: resp.stop_reason.unwrap_or_else(|| "stop".to_string()),
        model: resp.model,
    }
}

// Anthropic API response types (deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MessageRole;

    #[test]
    fn system_messages_lift_into_the_system_field() {
        let messages = vec![
            ChatMessage { role: MessageRole::System, content: "be terse".into() },
            ChatMessage { role: MessageRole::User, content: "hi".into() },
        ];
        let body = build_request_body(&messages, "claude-3-sonnet", &ChatOptions::default());
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn parse_response_joins_text_blocks() {
        let resp: ApiResponse = serde_json::from_value(serde_json::json!({
            "model": "claude-3-sonnet-20240229",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "t1"},
                {"type": "text", "text": " world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 2}
        }))
        .unwrap();
        let outcome = parse_response(resp);
        assert_eq!(outcome.text, "Hello world");
        assert_eq!(outcome.usage.input_tokens, Some(9));
        assert_eq!(outcome.finish_reason, "end_turn");
    }
}
