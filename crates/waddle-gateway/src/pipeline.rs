//! The end-to-end request pipeline for chat completions:
//!
//! RECEIVED → AUTHED → SCANNED → ADMITTED → ROUTED → ACCOUNTED → RESPONDED
//!
//! Error states are terminal: nothing later in the chain runs, so a
//! blocked or quota-rejected request can never write a usage record.
//! Authentication happens in the HTTP layer; this module takes over from
//! SCANNED onward.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use waddle_core::WaddleError;
use waddle_identity::permissions::{self, Permission};
use waddle_identity::PrincipalContext;
use waddle_ledger::estimate::estimate_messages;
use waddle_ledger::types::UsageParams;
use waddle_providers::provider::{ChatMessage, ChatOptions, MessageRole};
use waddle_providers::RouterError;
use waddle_security::patterns::sanitize_text;
use waddle_security::{ScanActor, SecurityAction};

use crate::app::AppState;

/// Fields the chat endpoint understands. Anything else the client sends
/// lands in `extra` and is forwarded to the upstream verbatim.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: UsageBlock,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: OutgoingMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct OutgoingMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct UsageBlock {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Normalized tokens, the tenant-facing billing unit.
    pub waddleai_tokens: u64,
}

/// Run one chat request through the pipeline. `ctx` comes from the auth
/// resolver; errors map to the wire taxonomy at the HTTP boundary.
pub async fn run_chat(
    state: &AppState,
    ctx: &PrincipalContext,
    request: ChatCompletionRequest,
    client_ip: Option<&str>,
) -> Result<ChatCompletionResponse, WaddleError> {
    permissions::check(
        ctx,
        Permission::ProxyUse,
        Some(&ctx.tenant_id),
        Some(&ctx.principal_id),
    )
    .map_err(WaddleError::from)?;

    // Quota and the ledger are keyed by credential; session tokens are
    // for the management surface, not the proxy path.
    let credential_id = ctx.credential_id.as_deref().ok_or_else(|| {
        warn!(principal = %ctx.principal_id, "chat request without an API credential");
        WaddleError::AuthorizationDenied {
            permission: Permission::ProxyUse.name().to_string(),
        }
    })?;

    if request.messages.is_empty() {
        return Err(WaddleError::MalformedRequest("messages must not be empty".into()));
    }
    let mut messages = to_provider_messages(&request.messages)?;

    // ── SCANNED ──────────────────────────────────────────────────────────
    let actor = ScanActor {
        principal_id: Some(&ctx.principal_id),
        credential_id: Some(credential_id),
        tenant_id: Some(&ctx.tenant_id),
        source_ip: client_ip,
    };

    if !state.scanner.check_rate_limit(&actor) {
        warn!(principal = %ctx.principal_id, "threat rate limit exceeded");
        return Err(WaddleError::SecurityRejected {
            threat: "repeat_offender".to_string(),
        });
    }

    let scan_text = messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let (threats, _sanitized) = state.scanner.scan(&scan_text, &actor);

    for threat in &threats {
        let kind = threat.kind.to_string();
        let action = threat.action.to_string();
        state
            .metrics
            .security_events_total
            .with_label_values(&[kind.as_str(), action.as_str()])
            .inc();
    }
    if let Some(blocking) = threats.iter().find(|t| t.action == SecurityAction::Block) {
        return Err(WaddleError::SecurityRejected {
            threat: blocking.kind.to_string(),
        });
    }
    for threat in threats.iter().filter(|t| t.action == SecurityAction::Sanitize) {
        for message in &mut messages {
            message.content = sanitize_text(threat.kind, &message.content);
        }
    }

    // ── ADMITTED ─────────────────────────────────────────────────────────
    let input_estimate = estimate_messages(messages.iter().map(|m| m.content.as_str()));
    let admission = state
        .accountant
        .check_admission(credential_id, input_estimate)
        .map_err(|e| WaddleError::Database(e.to_string()))?;
    if !admission.ok() {
        for (period, ok) in [("daily", admission.daily.ok), ("monthly", admission.monthly.ok)] {
            if !ok {
                state
                    .metrics
                    .quota_rejections_total
                    .with_label_values(&[period])
                    .inc();
            }
        }
        return Err(WaddleError::QuotaExceeded { detail: admission });
    }

    // ── ROUTED ───────────────────────────────────────────────────────────
    let options = ChatOptions {
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        extra: forwardable_extra(request.extra),
    };
    let slot = state.acquire_upstream_slot().await?;
    let routed = state
        .router
        .dispatch(&request.model, &messages, &options, None, state.upstream_budget())
        .await;
    drop(slot);

    let routed = match routed {
        Ok(routed) => {
            let provider = routed.provider_kind.to_string();
            state
                .metrics
                .llm_requests_total
                .with_label_values(&[provider.as_str(), request.model.as_str(), "success"])
                .inc();
            routed
        }
        Err(e) => {
            state
                .metrics
                .llm_requests_total
                .with_label_values(&["none", request.model.as_str(), "error"])
                .inc();
            return Err(match e {
                RouterError::NoCandidates(model) => WaddleError::AllProvidersFailed {
                    last_error: format!("no providers available for model {}", model),
                },
                RouterError::AllFailed { last_error } => {
                    WaddleError::AllProvidersFailed { last_error }
                }
                RouterError::NotRetriable(inner) => WaddleError::UpstreamFailed(inner.to_string()),
            });
        }
    };

    // ── ACCOUNTED ────────────────────────────────────────────────────────
    let input_text = messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let usage_params = UsageParams {
        credential_id,
        principal_id: &ctx.principal_id,
        tenant_id: &ctx.tenant_id,
        kind: routed.provider_kind,
        model: &request.model,
        link_id: Some(&routed.link_id),
        raw_input_tokens: routed.raw_input_tokens,
        raw_output_tokens: routed.raw_output_tokens,
        input_text: &input_text,
        output_text: &routed.text,
        success: true,
    };
    let usage = match state.accountant.record_usage(&usage_params) {
        Ok(usage) => {
            state
                .metrics
                .tokens_total
                .with_label_values(&["raw_input"])
                .inc_by(usage.raw_input_tokens);
            state
                .metrics
                .tokens_total
                .with_label_values(&["raw_output"])
                .inc_by(usage.raw_output_tokens);
            state
                .metrics
                .tokens_total
                .with_label_values(&["normalized"])
                .inc_by(usage.normalized_tokens);
            UsageBlock {
                prompt_tokens: usage.raw_input_tokens,
                completion_tokens: usage.raw_output_tokens,
                total_tokens: usage.raw_input_tokens + usage.raw_output_tokens,
                waddleai_tokens: usage.normalized_tokens,
            }
        }
        Err(e) => {
            // The upstream already answered; a ledger write failure is an
            // operator problem, not the client's.
            error!(credential = credential_id, err = %e, "accounting failed after response");
            state.metrics.accounting_failures_total.inc();
            let raw_in = routed.raw_input_tokens.unwrap_or(input_estimate);
            let raw_out = routed.raw_output_tokens.unwrap_or(0);
            UsageBlock {
                prompt_tokens: raw_in,
                completion_tokens: raw_out,
                total_tokens: raw_in + raw_out,
                waddleai_tokens: 0,
            }
        }
    };

    // ── RESPONDED ────────────────────────────────────────────────────────
    info!(
        principal = %ctx.principal_id,
        model = %request.model,
        link = %routed.link_name,
        attempts = routed.attempts,
        normalized = usage.waddleai_tokens,
        "chat request served"
    );
    let now = chrono::Utc::now().timestamp();
    Ok(ChatCompletionResponse {
        id: format!("chatcmpl-{}", now),
        object: "chat.completion",
        created: now,
        model: request.model,
        choices: vec![Choice {
            index: 0,
            message: OutgoingMessage {
                role: "assistant",
                content: routed.text,
            },
            finish_reason: if routed.finish_reason.is_empty() {
                "stop".to_string()
            } else {
                routed.finish_reason
            },
        }],
        usage,
    })
}

fn to_provider_messages(incoming: &[IncomingMessage]) -> Result<Vec<ChatMessage>, WaddleError> {
    incoming
        .iter()
        .map(|m| {
            let role = match m.role.as_str() {
                "system" => MessageRole::System,
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                other => {
                    return Err(WaddleError::MalformedRequest(format!(
                        "unknown message role: {}",
                        other
                    )))
                }
            };
            Ok(ChatMessage {
                role,
                content: m.content.clone(),
            })
        })
        .collect()
}

/// Client fields forwarded to the upstream. Transport-level keys that the
/// gateway owns are stripped.
fn forwardable_extra(
    mut extra: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    extra.remove("stream");
    extra.remove("session_id");
    extra
}
