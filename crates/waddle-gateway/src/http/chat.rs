//! OpenAI-compatible POST /v1/chat/completions.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::HeaderMap, Json};
use tracing::warn;
use uuid::Uuid;
use waddle_core::WaddleError;

use crate::app::AppState;
use crate::http::{authenticate, client_ip, ApiError};
use crate::pipeline::{run_chat, ChatCompletionRequest, ChatCompletionResponse};

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    let started = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let ctx = match authenticate(&state, &headers) {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!(
                request_id,
                kind = err.0.code(),
                duration_ms = started.elapsed().as_millis() as u64,
                "chat request rejected at auth"
            );
            return Err(err);
        }
    };

    let request: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|e| ApiError(WaddleError::MalformedRequest(e.to_string())))?;
    let ip = client_ip(&headers);

    // Run the pipeline on a detached task so a client disconnect cannot
    // abort it mid-flight: an upstream response that completes still gets
    // accounted even when nobody is left to read it.
    let task = {
        let state = state.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { run_chat(&state, &ctx, request, ip.as_deref()).await })
    };

    let result = task
        .await
        .map_err(|e| ApiError(WaddleError::internal(format!("pipeline task failed: {e}"))))?;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            warn!(
                request_id,
                principal = %ctx.principal_id,
                tenant = %ctx.tenant_id,
                kind = err.code(),
                duration_ms = started.elapsed().as_millis() as u64,
                "chat request failed"
            );
            Err(ApiError(err))
        }
    }
}
