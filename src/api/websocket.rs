//! WebSocket endpoint for device sessions

use std::sync::Arc;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;

use super::ApiState;
use crate::transport::split_websocket;

/// Create the WebSocket router mounted at `path`
///
/// The path is served both with and without a trailing slash.
pub fn router(state: Arc<ApiState>, path: &str) -> Router {
    let mut router = Router::new().route(path, get(ws_upgrade));

    let trimmed = path.trim_end_matches('/');
    if !trimmed.is_empty() && trimmed != path {
        router = router.route(trimmed, get(ws_upgrade));
    }

    router.with_state(state)
}

async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> Response {
    let gateway = Arc::clone(&state.gateway);
    ws.on_upgrade(move |socket| async move {
        let (sink, source) = split_websocket(socket);
        gateway.serve(Box::new(sink), Box::new(source)).await;
    })
}
