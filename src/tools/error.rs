use thiserror::Error;

use crate::engine::EngineError;

/// Failures surfaced by the tool layer. Every variant ends up as a message in
/// the `errors` list of the response envelope.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("No circuit loaded. Call load_feeder first")]
    NoCircuit,

    #[error("No power flow solution available. Call run_power_flow first")]
    NotSolved,

    #[error("Power flow did not converge")]
    NotConverged,

    #[error("No candidate bus produced a converged solution")]
    NoConvergedCandidate,

    #[error("Feeder '{requested}' is not loaded (active circuit: {active})")]
    FeederMismatch { requested: String, active: String },

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    MissingData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolError {
    /// Whether the caller sent something unusable, as opposed to the analysis
    /// failing on a valid request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ToolError::UnknownTool(_)
                | ToolError::InvalidArguments(_)
                | ToolError::Validation(_)
                | ToolError::InvalidInput(_)
                | ToolError::FeederMismatch { .. }
                | ToolError::NoCircuit
                | ToolError::NotSolved
                | ToolError::MissingData(_)
        ) || matches!(
            self,
            ToolError::Engine(
                EngineError::UnknownFeeder { .. }
                    | EngineError::UnknownBus(_)
                    | EngineError::InvalidValue(_)
            )
        )
    }
}
