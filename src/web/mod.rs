//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::layout::LayoutHandle;
use crate::poller::PollerHandles;
use crate::report::Aggregator;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub layout: LayoutHandle,
    pub aggregator: Arc<Aggregator<Store>>,
    pub poller: PollerHandles,
    /// Bumped after every successful layout reload.
    pub layout_version: watch::Sender<u64>,
}

/// Web server for kilnwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/api/health", get(handlers::handle_health))
        .route("/api/status", get(handlers::handle_status))
        .route("/api/latest", get(handlers::handle_latest))
        .route("/api/report", get(handlers::handle_report))
        .route("/api/history", get(handlers::handle_history))
        .route("/api/feeding", get(handlers::handle_feeding))
        .route("/api/alarms", get(handlers::handle_alarm_records))
        .route("/api/alarms/count", get(handlers::handle_alarm_count))
        .route("/api/alarms/limits", get(handlers::handle_alarm_limits))
        .route("/api/layout/reload", post(handlers::handle_layout_reload))
        .route("/ws", get(handlers::handle_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}
