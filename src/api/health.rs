//! Health check endpoint

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Sessions currently registered
    pub sessions: usize,
    pub uptime_secs: i64,
}

/// Liveness probe with the live session count
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let status = if state.gateway.registry.is_draining() {
        "draining"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.gateway.registry.len().await,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Create the health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}
