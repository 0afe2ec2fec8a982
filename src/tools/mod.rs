//! Analysis tools and their dispatcher.
//!
//! Each tool module exposes a typed argument struct (serde + validator) and a
//! function taking the [`Session`]. [`call_tool`] is the single entry point
//! used by every transport: it decodes arguments, runs the tool and folds any
//! failure into a [`ToolResponse`].

pub mod capacity;
pub mod definitions;
pub mod der_placement;
pub mod error;
pub mod feeder;
pub mod power_flow;
pub mod response;
pub mod snapshot;
pub mod timeseries;
pub mod visualization;
pub mod voltage;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use tracing::{error, info, info_span};
use uuid::Uuid;
use validator::Validate;

use crate::engine::{DerKind, DerSpec, FeederCatalog};
use crate::session::{Session, SharedSession};

pub use definitions::tool_definitions;
pub use error::ToolError;
pub use response::{Metadata, ToolOutput, ToolResponse};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolName {
    LoadFeeder,
    RunPowerFlow,
    CheckVoltages,
    AnalyzeCapacity,
    OptimizeDerPlacement,
    RunTimeSeries,
    GenerateVisualization,
}

/// Run a tool by name. Never fails: errors become an unsuccessful envelope.
pub fn call_tool(session: &mut Session, name: &str, arguments: Value) -> ToolResponse {
    let request_id = Uuid::new_v4();
    let span = info_span!("tool_call", tool = name, %request_id);
    let _guard = span.enter();
    let started = Instant::now();

    let result = name
        .parse::<ToolName>()
        .map_err(|_| ToolError::UnknownTool(name.to_string()))
        .and_then(|tool| dispatch(session, tool, arguments));
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok(response) => {
            info!(duration_ms, "tool call completed");
            response.with_duration(duration_ms)
        }
        Err(e) => {
            error!(duration_ms, error = %e, client_error = e.is_client_error(), "tool call failed");
            ToolResponse::error(e.to_string())
        }
    }
}

/// Run a tool on a shared session without blocking the async runtime.
pub async fn call_tool_shared(session: SharedSession, name: String, arguments: Value) -> ToolResponse {
    let task = tokio::task::spawn_blocking(move || {
        let mut session = session.lock();
        call_tool(&mut session, &name, arguments)
    });
    match task.await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "tool task aborted");
            ToolResponse::error(format!("Internal error: {e}"))
        }
    }
}

fn dispatch(session: &mut Session, tool: ToolName, arguments: Value) -> Result<ToolResponse, ToolError> {
    match tool {
        ToolName::LoadFeeder => feeder::load_feeder(session, parse(arguments)?)?.into_response(),
        ToolName::RunPowerFlow => power_flow::run_power_flow(session, parse(arguments)?)?.into_response(),
        ToolName::CheckVoltages => voltage::check_voltages(session, parse(arguments)?)?.into_response(),
        ToolName::AnalyzeCapacity => capacity::analyze_capacity(session, parse(arguments)?)?.into_response(),
        ToolName::OptimizeDerPlacement => {
            der_placement::optimize_der_placement(session, parse(arguments)?)?.into_response()
        }
        ToolName::RunTimeSeries => timeseries::run_time_series(session, parse(arguments)?)?.into_response(),
        ToolName::GenerateVisualization => {
            visualization::generate_visualization(session, parse(arguments)?)?.into_response()
        }
    }
}

/// Decode and validate tool arguments. A missing/null argument object is
/// treated as `{}` so tools whose parameters are all optional can be called
/// bare.
pub fn parse<T: DeserializeOwned + Validate>(arguments: Value) -> Result<T, ToolError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    let args: T = serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
    args.validate()?;
    Ok(args)
}

/// Fail unless `requested` (when given) names the active circuit.
pub(crate) fn ensure_feeder(session: &Session, requested: Option<&str>) -> Result<String, ToolError> {
    let active = session.circuit_name()?;
    if let Some(requested) = requested {
        let canonical = FeederCatalog::canonical_id(requested).unwrap_or(requested);
        if !canonical.eq_ignore_ascii_case(&active) {
            return Err(ToolError::FeederMismatch {
                requested: requested.to_string(),
                active,
            });
        }
    }
    Ok(active)
}

pub(crate) fn require_solved(session: &Session) -> Result<String, ToolError> {
    let name = session.circuit_name()?;
    if !session.engine.is_solved() {
        return Err(ToolError::NotSolved);
    }
    Ok(name)
}

/// Inverter oversizing applied to PV so it keeps reactive headroom at full output.
pub(crate) const SOLAR_KVA_RATIO: f64 = 1.1;

/// DER with the default rating for its technology.
pub(crate) fn default_der(name: &str, bus: &str, kind: DerKind, kw: f64) -> DerSpec {
    let spec = DerSpec::new(name, bus, kind, kw);
    match kind {
        DerKind::Solar => spec.with_kva(kw.abs() * SOLAR_KVA_RATIO),
        DerKind::Battery | DerKind::Wind => spec.with_kva(kw.abs()),
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
