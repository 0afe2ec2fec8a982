use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use strum::{Display, EnumString};
use tracing::{debug, info, warn};
use validator::Validate;

use super::snapshot::{GridSnapshot, VoltageLimits};
use super::{default_der, Metadata, ToolError, ToolOutput};
use crate::engine::{DerKind, DerSpec, EngineError, VoltVarCurve, VoltVarPreset};
use crate::session::Session;

const CANDIDATE_NAME: &str = "placement_candidate";
/// Hybrid PV+storage inverters are sized above the PV rating.
const HYBRID_KVA_RATIO: f64 = 1.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlacementDerType {
    Solar,
    Battery,
    Wind,
    SolarVvc,
    SolarBattery,
    SolarBatteryVvc,
}

impl PlacementDerType {
    pub fn has_volt_var(self) -> bool {
        matches!(self, PlacementDerType::SolarVvc | PlacementDerType::SolarBatteryVvc)
    }

    /// The engine element for this technology. Hybrids are modelled as one
    /// inverter exporting the PV output with the battery idle.
    pub fn spec(self, name: &str, bus: &str, kw: f64, curve: &VoltVarCurve) -> DerSpec {
        let spec = match self {
            PlacementDerType::Solar | PlacementDerType::SolarVvc => default_der(name, bus, DerKind::Solar, kw),
            PlacementDerType::Battery => default_der(name, bus, DerKind::Battery, kw),
            PlacementDerType::Wind => default_der(name, bus, DerKind::Wind, kw),
            PlacementDerType::SolarBattery | PlacementDerType::SolarBatteryVvc => {
                DerSpec::new(name, bus, DerKind::Solar, kw).with_kva(kw * HYBRID_KVA_RATIO)
            }
        };
        if self.has_volt_var() {
            spec.with_volt_var(curve.clone())
        } else {
            spec
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Objective {
    #[default]
    MinimizeLosses,
    MinimizeViolations,
    MaximizeCapacity,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct ControlSettings {
    pub curve: Option<VoltVarPreset>,
    #[validate(range(min = 0.0, max = 600.0))]
    pub response_time: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlacementArgs {
    pub der_type: PlacementDerType,
    #[validate(range(exclusive_min = 0.0, max = 100000.0))]
    pub capacity_kw: f64,
    #[serde(default)]
    pub objective: Objective,
    pub candidate_buses: Option<Vec<String>>,
    #[validate(range(min = 0.0))]
    pub battery_kwh: Option<f64>,
    #[serde(default)]
    #[validate(nested)]
    pub control_settings: Option<ControlSettings>,
}

/// Scores a candidate against the baseline. Higher is better.
pub trait PlacementObjective: Send + Sync {
    fn score(&self, baseline: &GridSnapshot, candidate: &GridSnapshot, ctx: &ScoreContext) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreContext {
    pub limits: VoltageLimits,
    pub max_line_loading_pct: f64,
}

pub struct LossReduction;

impl PlacementObjective for LossReduction {
    fn score(&self, baseline: &GridSnapshot, candidate: &GridSnapshot, _: &ScoreContext) -> f64 {
        baseline.losses_kw - candidate.losses_kw
    }
}

pub struct ViolationReduction;

impl PlacementObjective for ViolationReduction {
    fn score(&self, baseline: &GridSnapshot, candidate: &GridSnapshot, _: &ScoreContext) -> f64 {
        baseline.violation_count() as f64 - candidate.violation_count() as f64
    }
}

/// Remaining margin: the tighter of voltage headroom (pu × 100) and line
/// loading headroom (%).
pub struct RemainingHeadroom;

impl PlacementObjective for RemainingHeadroom {
    fn score(&self, _: &GridSnapshot, candidate: &GridSnapshot, ctx: &ScoreContext) -> f64 {
        let voltage = ctx
            .limits
            .headroom(candidate.min_voltage_pu)
            .min(ctx.limits.headroom(candidate.max_voltage_pu));
        let loading = ctx.max_line_loading_pct - candidate.max_line_loading_pct;
        (voltage * 100.0).min(loading)
    }
}

impl Objective {
    pub fn strategy(self) -> Box<dyn PlacementObjective> {
        match self {
            Objective::MinimizeLosses => Box::new(LossReduction),
            Objective::MinimizeViolations => Box::new(ViolationReduction),
            Objective::MaximizeCapacity => Box::new(RemainingHeadroom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateRow {
    pub bus_id: String,
    pub objective_value: f64,
    pub losses_kw: f64,
    pub loss_reduction_kw: f64,
    pub voltage_violations: usize,
    pub min_voltage_pu: f64,
    pub max_voltage_pu: f64,
    pub max_line_loading_pct: f64,
    pub q_support_kvar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImprovementMetrics {
    pub loss_reduction_kw: f64,
    pub loss_reduction_pct: f64,
    pub violation_reduction: i64,
    pub min_voltage_improvement_pu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementBaseline {
    pub losses_kw: f64,
    pub voltage_violations: usize,
    pub min_voltage_pu: f64,
    pub max_voltage_pu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedControl {
    pub curve: VoltVarPreset,
    pub points: Vec<(f64, f64)>,
    pub response_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementResult {
    pub der_type: PlacementDerType,
    pub optimal_bus: String,
    pub optimal_capacity_kw: f64,
    pub objective: Objective,
    pub battery_kwh: Option<f64>,
    pub improvement_metrics: ImprovementMetrics,
    pub comparison_table: Vec<CandidateRow>,
    pub baseline: PlacementBaseline,
    pub control_settings: Option<AppliedControl>,
    pub candidates_evaluated: usize,
    pub candidates_failed: Vec<String>,
}

/// Candidate buses: the caller's list (validated), or loaded non-source buses.
fn candidates(session: &Session, requested: Option<&[String]>) -> Result<Vec<String>, ToolError> {
    let topology = session.engine.topology()?;
    match requested {
        Some(list) => {
            if list.is_empty() {
                return Err(ToolError::InvalidInput("candidate_buses must not be empty".to_string()));
            }
            let mut out: Vec<String> = Vec::with_capacity(list.len());
            for bus in list {
                let name = bus.trim().to_lowercase();
                if !topology.buses.iter().any(|b| b.name == name) {
                    return Err(EngineError::UnknownBus(bus.clone()).into());
                }
                if !out.contains(&name) {
                    out.push(name);
                }
            }
            Ok(out)
        }
        None => Ok(topology
            .buses
            .iter()
            .filter(|b| b.has_load && b.name != topology.source_bus)
            .map(|b| b.name.clone())
            .take(session.config.analysis.max_candidates)
            .collect()),
    }
}

pub fn optimize_der_placement(
    session: &mut Session,
    args: PlacementArgs,
) -> Result<ToolOutput<PlacementResult>, ToolError> {
    let circuit = session.circuit_name()?;
    let buses = candidates(session, args.candidate_buses.as_deref())?;
    if buses.is_empty() {
        return Err(ToolError::InvalidInput("No candidate buses to evaluate".to_string()));
    }

    let settings = args.control_settings.clone().unwrap_or_default();
    let curve = VoltVarCurve::from_preset(
        settings.curve.unwrap_or_default(),
        settings.response_time.unwrap_or(10.0),
    );
    let ctx = ScoreContext {
        limits: VoltageLimits {
            min_voltage_pu: session.config.analysis.min_voltage_pu,
            max_voltage_pu: session.config.analysis.max_voltage_pu,
        },
        max_line_loading_pct: session.config.analysis.max_line_loading_pct,
    };
    let objective = args.objective.strategy();
    let options = session.default_solve_options();

    if !session.engine.solve(&options)?.converged {
        return Err(ToolError::NotConverged);
    }
    let baseline = GridSnapshot::capture(session.engine.as_ref(), &ctx.limits)?;

    let mut rows = Vec::with_capacity(buses.len());
    let mut failed = Vec::new();
    for bus in &buses {
        let spec = args.der_type.spec(CANDIDATE_NAME, bus, args.capacity_kw, &curve);
        session.engine.add_der(&spec)?;
        let evaluated = evaluate_candidate(session, &options, &ctx.limits);
        session.engine.remove_der(CANDIDATE_NAME)?;

        match evaluated? {
            Some((snap, q)) => {
                let row = CandidateRow {
                    bus_id: bus.clone(),
                    objective_value: objective.score(&baseline, &snap, &ctx),
                    losses_kw: snap.losses_kw,
                    loss_reduction_kw: baseline.losses_kw - snap.losses_kw,
                    voltage_violations: snap.violation_count(),
                    min_voltage_pu: snap.min_voltage_pu,
                    max_voltage_pu: snap.max_voltage_pu,
                    max_line_loading_pct: snap.max_line_loading_pct,
                    q_support_kvar: if args.der_type.has_volt_var() { q } else { 0.0 },
                };
                debug!(bus = %bus, score = row.objective_value, "candidate evaluated");
                rows.push(row);
            }
            None => {
                warn!(bus = %bus, "candidate did not converge, skipped");
                failed.push(bus.clone());
            }
        }
    }

    if let Err(e) = session.engine.solve(&options) {
        warn!(error = %e, "re-solving baseline after placement search failed");
    }

    rows.sort_by_key(|r| Reverse((OrderedFloat(r.objective_value), OrderedFloat(r.loss_reduction_kw))));
    let best = rows
        .first()
        .cloned()
        .ok_or(ToolError::NoConvergedCandidate)?;

    let improvement = ImprovementMetrics {
        loss_reduction_kw: best.loss_reduction_kw,
        loss_reduction_pct: if baseline.losses_kw > 0.0 {
            best.loss_reduction_kw / baseline.losses_kw * 100.0
        } else {
            0.0
        },
        violation_reduction: baseline.violation_count() as i64 - best.voltage_violations as i64,
        min_voltage_improvement_pu: best.min_voltage_pu - baseline.min_voltage_pu,
    };

    info!(
        circuit = %circuit,
        der_type = %args.der_type,
        objective = %args.objective,
        optimal_bus = %best.bus_id,
        evaluated = rows.len(),
        "DER placement search complete"
    );

    let result = PlacementResult {
        der_type: args.der_type,
        optimal_bus: best.bus_id.clone(),
        optimal_capacity_kw: args.capacity_kw,
        objective: args.objective,
        battery_kwh: args.battery_kwh,
        improvement_metrics: improvement,
        candidates_evaluated: rows.len(),
        comparison_table: rows,
        baseline: PlacementBaseline {
            losses_kw: baseline.losses_kw,
            voltage_violations: baseline.violation_count(),
            min_voltage_pu: baseline.min_voltage_pu,
            max_voltage_pu: baseline.max_voltage_pu,
        },
        control_settings: args.der_type.has_volt_var().then(|| AppliedControl {
            curve: curve.preset,
            points: curve.points.clone(),
            response_time: curve.response_time_s,
        }),
        candidates_failed: failed,
    };
    Ok(ToolOutput::new(result, Metadata::new("der_placement", Some(circuit))))
}

/// Solve with the candidate in place. `None` when the solve does not converge.
fn evaluate_candidate(
    session: &mut Session,
    options: &crate::engine::SolveOptions,
    limits: &VoltageLimits,
) -> Result<Option<(GridSnapshot, f64)>, ToolError> {
    if !session.engine.solve(options)?.converged {
        return Ok(None);
    }
    let snap = GridSnapshot::capture(session.engine.as_ref(), limits)?;
    let q = session.engine.der_output(CANDIDATE_NAME)?.kvar;
    Ok(Some((snap, q)))
}
