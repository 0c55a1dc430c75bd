use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::app::AppState;

/// GET /healthz — kubernetes-style liveness probe. Literal body, no JSON.
pub async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = {
        let conn = state.db.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0)).is_ok()
    };
    if db_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}
