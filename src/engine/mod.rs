//! Circuit engine seam.
//!
//! Everything above this module talks to the solver through [`CircuitEngine`].
//! [`SweepEngine`] is the bundled implementation; a binding to an external
//! simulator only has to implement the same trait.

pub mod control;
pub mod error;
pub mod feeders;
pub mod sweep;
pub mod types;

pub use control::{VoltVarCurve, VoltVarPreset};
pub use error::EngineError;
pub use feeders::{FeederCatalog, FeederTemplate};
pub use sweep::SweepEngine;
pub use types::*;

/// Operations the analysis tools need from a power-flow engine.
///
/// The engine holds a single active circuit. Any mutation (loads, DERs,
/// source setpoint, multiplier) invalidates the previous solution until the
/// next [`CircuitEngine::solve`].
#[cfg_attr(test, mockall::automock)]
pub trait CircuitEngine: Send {
    /// Drop the active circuit and any solution.
    fn clear(&mut self);

    /// Replace the active circuit with one built from `template`.
    fn compile(&mut self, template: &FeederTemplate) -> Result<(), EngineError>;

    fn circuit_name(&self) -> Option<String>;

    fn summary(&self) -> Result<CircuitSummary, EngineError>;

    fn set_source_pu(&mut self, pu: f64) -> Result<(), EngineError>;

    fn set_load_multiplier(&mut self, multiplier: f64) -> Result<(), EngineError>;

    fn load_multiplier(&self) -> f64;

    fn add_load(&mut self, load: &LoadSpec) -> Result<(), EngineError>;

    fn add_der(&mut self, der: &DerSpec) -> Result<(), EngineError>;

    fn set_der_kw(&mut self, name: &str, kw: f64) -> Result<(), EngineError>;

    fn remove_der(&mut self, name: &str) -> Result<(), EngineError>;

    /// Output of a DER at the last solution (zero reactive power before a solve).
    fn der_output(&self, name: &str) -> Result<DerOutput, EngineError>;

    fn solve(&mut self, options: &SolveOptions) -> Result<SolveReport, EngineError>;

    fn is_solved(&self) -> bool;

    /// One entry per energized bus phase.
    fn bus_voltages(&self) -> Result<Vec<BusVoltage>, EngineError>;

    fn line_flows(&self) -> Result<Vec<LineFlow>, EngineError>;

    fn losses(&self) -> Result<PowerTotals, EngineError>;

    /// Harmonic voltage and current magnitudes for each requested order.
    /// Requires a converged fundamental solution.
    fn solve_harmonics(&mut self, orders: &[u32]) -> Result<HarmonicSolution, EngineError>;

    fn topology(&self) -> Result<Topology, EngineError>;
}
