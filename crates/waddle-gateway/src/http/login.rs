//! POST /auth/login — exchanges a name/password pair for a signed
//! session token.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use waddle_core::WaddleError;

use crate::app::AppState;
use crate::http::ApiError;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let request: LoginRequest = serde_json::from_value(body)
        .map_err(|e| ApiError(WaddleError::MalformedRequest(e.to_string())))?;

    let (ctx, token) = state
        .auth
        .login(&request.username, &request.password)
        .map_err(|e| {
            warn!(username = %request.username, "login failed");
            ApiError::from(e)
        })?;

    Ok(Json(json!({
        "token": token,
        "principal_id": ctx.principal_id,
        "role": ctx.role,
        "tenant": ctx.tenant_id,
    })))
}
