pub mod admin;
pub mod chat;
pub mod health;
pub mod login;
pub mod models;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use waddle_core::types::AuthFailure;
use waddle_core::WaddleError;
use waddle_identity::PrincipalContext;

use crate::app::AppState;

/// Wire-facing error wrapper. Every handler funnels failures through
/// this so the taxonomy maps to one consistent envelope.
pub struct ApiError(pub WaddleError);

impl From<WaddleError> for ApiError {
    fn from(err: WaddleError) -> Self {
        ApiError(err)
    }
}

impl From<waddle_identity::IdentityError> for ApiError {
    fn from(err: waddle_identity::IdentityError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = json!({
            "message": client_message(&err),
            "type": err.code(),
            "code": err.code(),
        });
        match &err {
            WaddleError::QuotaExceeded { detail } => {
                body["daily"] = serde_json::to_value(detail.daily).unwrap_or_default();
                body["monthly"] = serde_json::to_value(detail.monthly).unwrap_or_default();
            }
            WaddleError::SecurityRejected { threat } => {
                body["threat"] = json!(threat);
            }
            WaddleError::Internal { correlation_id, .. } => {
                body["correlation_id"] = json!(correlation_id);
            }
            _ => {}
        }

        (status, Json(json!({ "error": body }))).into_response()
    }
}

/// Message shown to the client. Internal kinds collapse to a generic
/// line; the detail stays in the structured log only.
fn client_message(err: &WaddleError) -> String {
    match err {
        WaddleError::Internal { .. }
        | WaddleError::Database(_)
        | WaddleError::Serialization(_)
        | WaddleError::Config(_) => "internal server error".to_string(),
        other => other.to_string(),
    }
}

/// Pull the bearer credential out of the Authorization header and
/// resolve it to a principal context.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<PrincipalContext, ApiError> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(WaddleError::AuthenticationFailed(AuthFailure::Malformed))?;
    Ok(state.auth.resolve_bearer(bearer)?)
}

/// Client IP as reported by the fronting reverse proxy.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

/// Per-request HTTP metrics: counter by status plus a latency histogram.
pub async fn track_metrics(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    state
        .metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), path.as_str(), status.as_str()])
        .inc();
    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[method.as_str(), path.as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}
