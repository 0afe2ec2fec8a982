use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};
use tracing::info;
use validator::Validate;

use super::snapshot::VoltageLimits;
use super::{require_solved, Metadata, ToolError, ToolOutput};
use crate::engine::BusVoltage;
use crate::session::Session;

/// Deviation bands, in per-unit beyond the violated limit.
pub const MINOR_DEVIATION_PU: f64 = 0.02;
pub const MODERATE_DEVIATION_PU: f64 = 0.05;

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CheckVoltagesArgs {
    #[validate(range(min = 0.5, max = 1.5))]
    pub min_voltage_pu: Option<f64>,
    #[validate(range(min = 0.5, max = 1.5))]
    pub max_voltage_pu: Option<f64>,
    #[validate(range(min = 1, max = 3))]
    pub phase: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ViolationType {
    Undervoltage,
    Overvoltage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Minor,
    Moderate,
    Severe,
}

impl Severity {
    pub fn from_deviation(deviation_pu: f64) -> Self {
        if deviation_pu <= MINOR_DEVIATION_PU {
            Severity::Minor
        } else if deviation_pu <= MODERATE_DEVIATION_PU {
            Severity::Moderate
        } else {
            Severity::Severe
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub bus: String,
    pub phase: u8,
    pub voltage_pu: f64,
    pub violation_type: ViolationType,
    pub deviation_pu: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeverityCounts {
    pub minor: usize,
    pub moderate: usize,
    pub severe: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationSummary {
    pub total_violations: usize,
    pub undervoltage_count: usize,
    pub overvoltage_count: usize,
    pub severity_counts: SeverityCounts,
    pub worst_violation: Option<Violation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedLimits {
    pub min_voltage_pu: f64,
    pub max_voltage_pu: f64,
    pub phase_filter: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoltageCheckResult {
    pub violations: Vec<Violation>,
    pub summary: ViolationSummary,
    pub limits: AppliedLimits,
    pub total_buses_checked: usize,
    /// Every checked bus phase, kept for plotting.
    #[serde(skip)]
    pub checked: Vec<BusVoltage>,
}

/// Classify one bus phase against the band.
pub fn classify(voltage: &BusVoltage, limits: &VoltageLimits) -> Option<Violation> {
    let v = voltage.magnitude_pu;
    let (violation_type, deviation_pu) = if limits.is_under(v) {
        (ViolationType::Undervoltage, limits.min_voltage_pu - v)
    } else if limits.is_over(v) {
        (ViolationType::Overvoltage, v - limits.max_voltage_pu)
    } else {
        return None;
    };
    Some(Violation {
        bus: voltage.bus.clone(),
        phase: voltage.phase,
        voltage_pu: v,
        violation_type,
        deviation_pu,
        severity: Severity::from_deviation(deviation_pu),
    })
}

/// Scan `voltages` and build the full report.
pub fn evaluate(voltages: Vec<BusVoltage>, limits: VoltageLimits, phase: Option<u8>) -> VoltageCheckResult {
    let checked: Vec<BusVoltage> = voltages
        .into_iter()
        .filter(|v| phase.map_or(true, |p| v.phase == p))
        .collect();
    let violations: Vec<Violation> = checked.iter().filter_map(|v| classify(v, &limits)).collect();

    let mut counts = SeverityCounts::default();
    for v in &violations {
        match v.severity {
            Severity::Minor => counts.minor += 1,
            Severity::Moderate => counts.moderate += 1,
            Severity::Severe => counts.severe += 1,
        }
    }
    let undervoltage_count = violations
        .iter()
        .filter(|v| v.violation_type == ViolationType::Undervoltage)
        .count();
    let worst_violation = violations
        .iter()
        .max_by(|a, b| a.deviation_pu.total_cmp(&b.deviation_pu))
        .cloned();
    let total_buses_checked = checked.iter().map(|v| v.bus.as_str()).collect::<BTreeSet<_>>().len();

    VoltageCheckResult {
        summary: ViolationSummary {
            total_violations: violations.len(),
            undervoltage_count,
            overvoltage_count: violations.len() - undervoltage_count,
            severity_counts: counts,
            worst_violation,
        },
        violations,
        limits: AppliedLimits {
            min_voltage_pu: limits.min_voltage_pu,
            max_voltage_pu: limits.max_voltage_pu,
            phase_filter: phase,
        },
        total_buses_checked,
        checked,
    }
}

pub fn check_voltages(
    session: &mut Session,
    args: CheckVoltagesArgs,
) -> Result<ToolOutput<VoltageCheckResult>, ToolError> {
    let circuit = require_solved(session)?;
    let limits = VoltageLimits {
        min_voltage_pu: args.min_voltage_pu.unwrap_or(session.config.analysis.min_voltage_pu),
        max_voltage_pu: args.max_voltage_pu.unwrap_or(session.config.analysis.max_voltage_pu),
    };
    if limits.min_voltage_pu >= limits.max_voltage_pu {
        return Err(ToolError::InvalidInput(format!(
            "min_voltage_pu ({}) must be less than max_voltage_pu ({})",
            limits.min_voltage_pu, limits.max_voltage_pu
        )));
    }

    let result = evaluate(session.engine.bus_voltages()?, limits, args.phase);
    info!(
        circuit = %circuit,
        violations = result.summary.total_violations,
        undervoltage = result.summary.undervoltage_count,
        overvoltage = result.summary.overvoltage_count,
        "voltage check complete"
    );
    session.results.voltage_check = Some(result.clone());
    Ok(ToolOutput::new(result, Metadata::new("voltage_violations", Some(circuit))))
}
