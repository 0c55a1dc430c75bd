//! Operational endpoints: quota introspection and routing control.

use std::str::FromStr;
use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use waddle_core::types::RoutingStrategy;
use waddle_core::WaddleError;
use waddle_identity::permissions::{self, Permission};

use crate::app::AppState;
use crate::http::{authenticate, ApiError};

/// GET /api/quota — admission view for the calling credential.
pub async fn quota_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    permissions::check(
        &ctx,
        Permission::QuotaRead,
        Some(&ctx.tenant_id),
        Some(&ctx.principal_id),
    )
    .map_err(WaddleError::from)?;

    let credential_id = ctx.credential_id.as_deref().ok_or_else(|| {
        WaddleError::MalformedRequest("quota lookup requires an API credential".into())
    })?;
    let detail = state
        .accountant
        .check_admission(credential_id, 0)
        .map_err(|e| WaddleError::Database(e.to_string()))?;

    Ok(Json(json!({
        "quota_ok": detail.ok(),
        "daily": detail.daily,
        "monthly": detail.monthly,
    })))
}

/// GET /api/routing/stats — current strategy plus per-link health.
pub async fn routing_stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    permissions::check(&ctx, Permission::AnalyticsRead, None, None)
        .map_err(WaddleError::from)?;

    let mut stats = serde_json::Map::new();
    for (link_id, health) in state.health.all() {
        let success_rate = if health.total_requests > 0 {
            health.successful_requests as f64 / health.total_requests as f64
        } else {
            0.0
        };
        stats.insert(
            link_id,
            json!({
                "total_requests": health.total_requests,
                "successful_requests": health.successful_requests,
                "failed_requests": health.failed_requests,
                "success_rate": success_rate,
                "avg_latency_ms": health.avg_latency_ms,
                "consecutive_failures": health.consecutive_failures,
                "in_flight": health.in_flight,
                "last_success": health.last_success,
                "last_failure": health.last_failure,
            }),
        );
    }

    Ok(Json(json!({
        "routing_strategy": state.router.strategy(),
        "provider_stats": stats,
    })))
}

/// POST /api/providers/reload — rebuild the registry snapshot from the
/// provider_links table. Admin only.
pub async fn reload_providers_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    permissions::check(&ctx, Permission::ProviderConfig, None, None)
        .map_err(WaddleError::from)?;

    let count = state
        .registry
        .reload()
        .map_err(|e| WaddleError::Database(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "providers": count })))
}

/// POST /api/providers/{link_id}/pull — pull a model onto an
/// ollama-kind link. Admin only; other kinds return upstream_failed.
pub async fn pull_model_handler(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(link_id): axum::extract::Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    permissions::check(&ctx, Permission::ProviderConfig, None, None)
        .map_err(WaddleError::from)?;
    let model = require_model(&body)?;

    let provider = state
        .registry
        .snapshot()
        .by_id(&link_id)
        .ok_or_else(|| WaddleError::MalformedRequest(format!("no such link: {}", link_id)))?;
    provider
        .handle
        .pull_model(&model)
        .await
        .map_err(|e| WaddleError::UpstreamFailed(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "model": model })))
}

/// POST /api/providers/{link_id}/remove — drop a model from an
/// ollama-kind link. Admin only.
pub async fn remove_model_handler(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(link_id): axum::extract::Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    permissions::check(&ctx, Permission::ProviderConfig, None, None)
        .map_err(WaddleError::from)?;
    let model = require_model(&body)?;

    let provider = state
        .registry
        .snapshot()
        .by_id(&link_id)
        .ok_or_else(|| WaddleError::MalformedRequest(format!("no such link: {}", link_id)))?;
    provider
        .handle
        .remove_model(&model)
        .await
        .map_err(|e| WaddleError::UpstreamFailed(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "model": model })))
}

fn require_model(body: &Value) -> Result<String, WaddleError> {
    body.get("model")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| WaddleError::MalformedRequest("model field required".into()))
}

/// POST /api/routing/strategy — switch the default strategy. Admin only.
pub async fn set_strategy_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    permissions::check(&ctx, Permission::SystemConfig, None, None)
        .map_err(WaddleError::from)?;

    let name = body
        .get("strategy")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WaddleError::MalformedRequest("strategy field required".into()))?;
    let strategy = RoutingStrategy::from_str(name)
        .map_err(WaddleError::MalformedRequest)?;

    state.router.set_strategy(strategy);
    Ok(Json(json!({ "status": "success", "strategy": strategy })))
}
