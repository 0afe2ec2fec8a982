use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use super::control::VoltVarCurve;

/// Solution modes understood by the engine. Codes follow the numbering used by
/// common distribution simulators so they can be passed through to one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SolutionMode {
    #[default]
    #[strum(to_string = "snapshot", serialize = "snap")]
    Snapshot,
    Daily,
    Yearly,
    DutyCycle,
    Direct,
    MonteCarlo1,
    MonteCarlo2,
    MonteCarlo3,
    FaultStudy,
    Mf,
    PeakDay,
    LoadDuration1,
    LoadDuration2,
}

impl SolutionMode {
    pub fn code(self) -> u8 {
        match self {
            SolutionMode::Snapshot => 0,
            SolutionMode::Daily => 1,
            SolutionMode::Yearly => 2,
            SolutionMode::DutyCycle => 3,
            SolutionMode::Direct => 4,
            SolutionMode::MonteCarlo1 => 5,
            SolutionMode::MonteCarlo2 => 6,
            SolutionMode::MonteCarlo3 => 7,
            SolutionMode::FaultStudy => 8,
            SolutionMode::Mf => 9,
            SolutionMode::PeakDay => 10,
            SolutionMode::LoadDuration1 => 11,
            SolutionMode::LoadDuration2 => 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOptions {
    pub max_iterations: u32,
    pub tolerance: f64,
    pub mode: SolutionMode,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 0.0001,
            mode: SolutionMode::Snapshot,
        }
    }
}

impl SolveOptions {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_mode(mut self, mode: SolutionMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub converged: bool,
    /// Sweep iterations summed over all control passes.
    pub iterations: u32,
    pub control_iterations: u32,
    pub max_mismatch: f64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DerKind {
    Solar,
    Battery,
    Wind,
}

/// A generating element placed on a bus. Output is split evenly over the
/// bus's phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerSpec {
    pub name: String,
    pub bus: String,
    pub kind: DerKind,
    pub kw: f64,
    /// Fixed reactive output, ignored when a volt-var curve is set.
    #[serde(default)]
    pub kvar: f64,
    /// Inverter rating. Defaults to `kw` when absent.
    #[serde(default)]
    pub kva: Option<f64>,
    #[serde(default)]
    pub volt_var: Option<VoltVarCurve>,
}

impl DerSpec {
    pub fn new(name: impl Into<String>, bus: impl Into<String>, kind: DerKind, kw: f64) -> Self {
        Self {
            name: name.into(),
            bus: bus.into(),
            kind,
            kw,
            kvar: 0.0,
            kva: None,
            volt_var: None,
        }
    }

    pub fn with_kva(mut self, kva: f64) -> Self {
        self.kva = Some(kva);
        self
    }

    pub fn with_volt_var(mut self, curve: VoltVarCurve) -> Self {
        self.volt_var = Some(curve);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerOutput {
    pub kw: f64,
    pub kvar: f64,
    pub kva: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSpec {
    pub name: String,
    pub bus: String,
    /// Empty means every phase present at the bus.
    #[serde(default)]
    pub phases: Vec<u8>,
    pub kw: f64,
    #[serde(default)]
    pub kvar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSummary {
    pub name: String,
    pub num_buses: usize,
    pub num_lines: usize,
    pub num_transformers: usize,
    pub num_loads: usize,
    pub num_ders: usize,
    pub total_load_kw: f64,
    pub total_load_kvar: f64,
    pub voltage_bases_kv: Vec<f64>,
    pub feeder_length_km: f64,
    pub source_bus: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusVoltage {
    pub bus: String,
    pub phase: u8,
    pub magnitude_pu: f64,
    pub angle_deg: f64,
    pub kv_base: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineFlow {
    pub name: String,
    pub from_bus: String,
    pub to_bus: String,
    /// Highest phase current.
    pub current_amps: f64,
    pub normal_amps: f64,
    pub loading_pct: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerTotals {
    pub kw: f64,
    pub kvar: f64,
}

/// Per-order magnitudes. Voltages are per-unit on the bus's first phase,
/// currents are per-unit on the line's first phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarmonicSolution {
    pub voltages: BTreeMap<u32, BTreeMap<String, f64>>,
    pub currents: BTreeMap<u32, BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BranchKind {
    Line,
    Switch,
    Transformer,
    Regulator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyBus {
    pub name: String,
    pub kv_base: f64,
    pub phases: Vec<u8>,
    /// Number of branches between this bus and the source.
    pub depth: usize,
    pub has_load: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub name: String,
    pub from: String,
    pub to: String,
    pub kind: BranchKind,
    pub length_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub source_bus: String,
    /// Breadth-first order from the source.
    pub buses: Vec<TopologyBus>,
    pub edges: Vec<TopologyEdge>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_solution_mode_aliases() {
        assert_eq!("snap".parse::<SolutionMode>().unwrap(), SolutionMode::Snapshot);
        assert_eq!("SNAPSHOT".parse::<SolutionMode>().unwrap(), SolutionMode::Snapshot);
        assert_eq!("montecarlo2".parse::<SolutionMode>().unwrap().code(), 6);
        assert_eq!("loadduration2".parse::<SolutionMode>().unwrap().code(), 12);
        assert!("weekly".parse::<SolutionMode>().is_err());
    }

    #[test]
    fn test_solution_mode_codes_are_unique() {
        let mut codes: Vec<u8> = SolutionMode::iter().map(|m| m.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), SolutionMode::iter().count());
    }

    #[test]
    fn test_der_kind_parse() {
        assert_eq!("Solar".parse::<DerKind>().unwrap(), DerKind::Solar);
        assert_eq!(DerKind::Battery.to_string(), "battery");
    }
}
