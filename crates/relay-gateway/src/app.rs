use std::sync::Arc;

use axum::{routing::get, Router};
use relay_agent::Dispatcher;
use tower_http::trace::TraceLayer;

/// Shared state for the HTTP side; the chat side owns everything else.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
