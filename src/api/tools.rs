use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde_json::Value;

use super::{error::ApiError, AppState};
use crate::tools::{call_tool_shared, definitions::ToolDefinition, tool_definitions, ToolName};

/// GET /api/v1/tools
pub async fn list_tools() -> Json<Vec<ToolDefinition>> {
    Json(tool_definitions())
}

/// POST /api/v1/tools/:name - body is the argument object (may be empty).
///
/// Answers 200 with the envelope whether or not the tool succeeded.
pub async fn call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if name.parse::<ToolName>().is_err() {
        return Err(ApiError::NotFound(format!("Unknown tool: {name}")));
    }
    let arguments = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };
    let response = call_tool_shared(state.session.clone(), name, arguments).await;
    Ok(Json(response.to_value()))
}
