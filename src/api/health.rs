use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use super::AppState;

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct CircuitStatus {
    pub circuit: Option<String>,
    pub solved: bool,
    /// A tool call holds the session; circuit and solved are unknown.
    pub busy: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// GET /api/v1/circuit - the active circuit and whether it has a solution.
/// Never waits on a running tool call.
pub async fn circuit_status(State(state): State<AppState>) -> Json<CircuitStatus> {
    let status = match state.session.try_lock() {
        Some(session) => CircuitStatus {
            circuit: session.engine.circuit_name(),
            solved: session.engine.is_solved(),
            busy: false,
            timestamp: chrono::Utc::now(),
        },
        None => CircuitStatus {
            circuit: None,
            solved: false,
            busy: true,
            timestamp: chrono::Utc::now(),
        },
    };
    Json(status)
}
