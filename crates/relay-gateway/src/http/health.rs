use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health: liveness, backend reachability and request metrics.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let dispatcher = &state.dispatcher;
    let backend_healthy = dispatcher.backend().health_check().await;

    Json(json!({
        "status": if backend_healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "backend": {
            "name": dispatcher.backend().name(),
            "healthy": backend_healthy,
        },
        "shutting_down": dispatcher.is_shutting_down(),
        "in_flight": dispatcher.in_flight(),
        "sessions": dispatcher.sessions().stats(),
        "metrics": dispatcher.metrics().snapshot(),
    }))
}
