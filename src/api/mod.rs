//! HTTP and WebSocket surface for the voicelink gateway

pub mod health;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::config::ServerConfig;
use crate::session::Gateway;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<Gateway>,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            started_at: Utc::now(),
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
    ws_path: String,
}

impl ApiServer {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, server: &ServerConfig) -> Self {
        Self {
            state: Arc::new(ApiState::new(gateway)),
            host: server.host.clone(),
            port: server.port,
            ws_path: server.ws_path.clone(),
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .merge(websocket::router(self.state.clone(), &self.ws_path))
            .merge(health::router(self.state.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves, then drain sessions
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(%addr, ws_path = %self.ws_path, "voicelink gateway listening");

        let gateway = Arc::clone(&self.state.gateway);
        let drain = async move {
            shutdown.await;
            let timeout = gateway.session.drain_timeout();
            tracing::info!(timeout_secs = timeout.as_secs(), "shutting down, draining sessions");
            if !gateway.registry.drain(timeout).await {
                let remaining = gateway.registry.len().await;
                tracing::warn!(remaining, "sessions still open after drain timeout");
            }
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(drain)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("server stopped");
        Ok(())
    }
}

/// Resolve on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl-c"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
