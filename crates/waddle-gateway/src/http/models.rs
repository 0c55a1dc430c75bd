//! GET /v1/models — union of models across enabled provider links.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use tracing::debug;

use crate::app::AppState;
use crate::http::{authenticate, ApiError};

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authenticate(&state, &headers)?;

    let snapshot = state.registry.snapshot();
    let mut models = Vec::new();
    for provider in &snapshot.providers {
        match provider.handle.list_models().await {
            Ok(list) => models.extend(list),
            Err(e) => {
                // A dead backend should not empty the whole listing.
                debug!(link = %provider.link.name, err = %e, "model listing failed");
            }
        }
    }

    Ok(Json(json!({ "object": "list", "data": models })))
}
