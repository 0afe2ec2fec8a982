//! HTTP transport: the same tools as the MCP server, one POST per call.

pub mod error;
pub mod health;
pub mod tools;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::Config, session::SharedSession};

/// Request bodies are tool arguments; load profiles are the largest of them.
const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub session: SharedSession,
}

pub fn router(state: AppState, cfg: &Config) -> Router {
    let v1 = Router::new()
        .route("/tools", get(tools::list_tools))
        .route("/tools/:name", post(tools::call))
        .route("/circuit", get(health::circuit_status));

    Router::new()
        .route("/healthz", get(health::healthz))
        .nest("/api/v1", v1)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(BODY_LIMIT_BYTES))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(cfg.server.request_timeout_secs),
                )),
        )
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    cfg: &Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = cfg.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    axum::serve(listener, router(state, cfg))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
