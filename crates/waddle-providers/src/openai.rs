use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use waddle_core::types::ProviderKind;

use crate::db::ProviderLink;
use crate::provider::{
    ChatMessage, ChatOptions, ChatOutcome, HealthStatus, ModelDescriptor, ProviderError,
    ProviderHandle, RawUsage,
};

/// Handle for OpenAI-compatible backends (OpenAI itself plus the long
/// tail of services that clone its chat completions dialect).
pub struct OpenAiHandle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    advertised: Vec<String>,
}

impl OpenAiHandle {
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
impl ProviderHandle for OpenAiHandle {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        let body = build_request_body(messages, model, options);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model, "sending request to OpenAI-compatible backend");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(connect_to_unavailable)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
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
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(connect_to_unavailable)?;

        if !resp.status().is_success() {
            // Many compatible backends skip /v1/models; fall back to the
            // models this link advertises in its config.
            return Ok(advertised_descriptors(&self.advertised, ProviderKind::OpenAi, "openai"));
        }

        let listing: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(listing
            .data
            .into_iter()
            .map(|m| ModelDescriptor {
                context_length: context_length(&m.id),
                id: m.id,
                provider: ProviderKind::OpenAi,
                created: m.created.unwrap_or(0),
                owned_by: m.owned_by.unwrap_or_else(|| "openai".to_string()),
            })
            .collect())
    }

    async fn health(&self) -> HealthStatus {
        let url = format!("{}/v1/models", self.base_url);
        match self.client.get(&url).bearer_auth(&self.api_key).send().await {
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
}

/// Surface connection failures as Unavailable so the router can fall back.
pub(crate) fn connect_to_unavailable(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else if e.is_connect() {
        ProviderError::Unavailable(e.to_string())
    } else {
        ProviderError::Http(e)
    }
}

pub(crate) fn advertised_descriptors(
    advertised: &[String],
    provider: ProviderKind,
    owned_by: &str,
) -> Vec<ModelDescriptor> {
    advertised
        .iter()
        .map(|id| ModelDescriptor {
            id: id.clone(),
            provider,
            created: 0,
            owned_by: owned_by.to_string(),
            context_length: context_length(id),
        })
        .collect()
}

/// Rough context windows for display in `/v1/models`; unknown models get
/// a conservative default.
pub(crate) fn context_length(model: &str) -> u64 {
    if model.starts_with("gpt-4") {
        8192
    } else if model.starts_with("claude-3") {
        200_000
    } else if model.starts_with("gpt-3.5") {
        4096
    } else {
        4096
    }
}

fn build_request_body(
    messages: &[ChatMessage],
    model: &str,
    options: &ChatOptions,
) -> serde_json::Value {
    let msgs: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": msgs,
    });
    if let Some(max_tokens) = options.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    // Unknown client fields ride through to the upstream untouched.
    for (key, value) in &options.extra {
        body[key] = value.clone();
    }
    body
}

fn parse_response(resp: ApiResponse) -> ChatOutcome {
    let choice = resp.choices.into_iter().next();
    let text = choice
        .as_ref()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish_reason = choice
        .and_then(|c| c.finish_reason)
        .unwrap_or_else(|| "stop".to_string());

    ChatOutcome {
        text,
        usage: RawUsage {
            input_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: resp.usage.as_ref().map(|u| u.completion_tokens),
        },
        finish_reason,
        model: resp.model,
    }
}

// OpenAI API response types (deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    created: Option<i64>,
    owned_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MessageRole;

    #[test]
    fn request_body_forwards_extra_fields_verbatim() {
        let messages = vec![ChatMessage {
            role: MessageRole::User,
            content: "hi".into(),
        }];
        let mut options = ChatOptions {
            max_tokens: Some(64),
            temperature: Some(0.5),
            ..Default::default()
        };
        options
            .extra
            .insert("top_p".to_string(), serde_json::json!(0.9));
        options
            .extra
            .insert("stop".to_string(), serde_json::json!(["END"]));

        let body = build_request_body(&messages, "gpt-4", &options);
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn parse_response_extracts_text_and_usage() {
        let resp: ApiResponse = serde_json::from_value(serde_json::json!({
            "model": "gpt-4-0613",
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();
        let outcome = parse_response(resp);
        assert_eq!(outcome.text, "hello");
        assert_eq!(outcome.usage.input_tokens, Some(12));
        assert_eq!(outcome.usage.output_tokens, Some(3));
        assert_eq!(outcome.finish_reason, "stop");
    }

    #[test]
    fn missing_usage_stays_none_for_the_estimator() {
        let resp: ApiResponse = serde_json::from_value(serde_json::json!({
            "model": "m",
            "choices": [{"message": {"content": "x"}, "finish_reason": null}]
        }))
        .unwrap();
        let outcome = parse_response(resp);
        assert!(outcome.usage.input_tokens.is_none());
        assert_eq!(outcome.finish_reason, "stop");
    }
}
