//! HTTP health endpoint.
//!
//! Served on the same port as the WebSocket channel so one `GET /health`
//! answers "is the daemon up, is the agent attached, who is registered".

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::daemon::Daemon;

pub fn create_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .with_state(daemon)
}

async fn health(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(daemon.health_snapshot())
}
