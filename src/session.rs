use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::{CircuitEngine, SolveOptions, SweepEngine};
use crate::tools::capacity::CapacityResult;
use crate::tools::power_flow::{HarmonicsReport, PowerFlowResult};
use crate::tools::timeseries::TimeSeriesResult;
use crate::tools::voltage::VoltageCheckResult;
use crate::tools::ToolError;

/// Latest result of each analysis, kept as visualization input.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    pub power_flow: Option<PowerFlowResult>,
    pub harmonics: Option<HarmonicsReport>,
    pub voltage_check: Option<VoltageCheckResult>,
    pub capacity: Option<CapacityResult>,
    pub timeseries: Option<TimeSeriesResult>,
}

impl ResultStore {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// State shared by all tool calls: the engine holding the active circuit,
/// stored results and configured defaults.
pub struct Session {
    pub engine: Box<dyn CircuitEngine>,
    pub results: ResultStore,
    pub config: Config,
}

pub type SharedSession = Arc<Mutex<Session>>;

impl Session {
    pub fn new(engine: Box<dyn CircuitEngine>, config: Config) -> Self {
        Self {
            engine,
            results: ResultStore::default(),
            config,
        }
    }

    pub fn with_config(config: Config) -> Self {
        Self::new(Box::new(SweepEngine::new()), config)
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Name of the active circuit, or an error when nothing is loaded.
    pub fn circuit_name(&self) -> Result<String, ToolError> {
        self.engine.circuit_name().ok_or(ToolError::NoCircuit)
    }

    /// Solver options from configuration.
    pub fn default_solve_options(&self) -> SolveOptions {
        SolveOptions::default()
            .with_max_iterations(self.config.engine.max_iterations)
            .with_tolerance(self.config.engine.tolerance)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::with_config(Config::default())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("circuit", &self.engine.circuit_name())
            .field("results", &self.results)
            .finish()
    }
}
