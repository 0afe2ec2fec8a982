use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, warn};
use validator::Validate;

use super::snapshot::{GridSnapshot, VoltageLimits};
use super::{default_der, Metadata, ToolError, ToolOutput};
use crate::engine::{DerKind, EngineError};
use crate::session::Session;

const PROBE_NAME: &str = "hosting_capacity_probe";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CapacityArgs {
    #[validate(length(min = 1))]
    pub bus_id: String,
    pub der_type: DerKind,
    #[validate(range(exclusive_min = 0.0, max = 10000.0))]
    pub increment_kw: Option<f64>,
    #[validate(range(exclusive_min = 0.0, max = 100000.0))]
    pub max_capacity_kw: Option<f64>,
    #[serde(default)]
    #[validate(nested)]
    pub constraints: Option<CapacityConstraints>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct CapacityConstraints {
    #[validate(range(min = 0.5, max = 1.5))]
    pub min_voltage_pu: f64,
    #[validate(range(min = 0.5, max = 1.5))]
    pub max_voltage_pu: f64,
    #[validate(range(exclusive_min = 0.0, max = 1000.0))]
    pub max_line_loading_pct: f64,
}

impl Default for CapacityConstraints {
    fn default() -> Self {
        Self {
            min_voltage_pu: 0.95,
            max_voltage_pu: 1.05,
            max_line_loading_pct: 100.0,
        }
    }
}

impl CapacityConstraints {
    fn voltage_limits(&self) -> VoltageLimits {
        VoltageLimits {
            min_voltage_pu: self.min_voltage_pu,
            max_voltage_pu: self.max_voltage_pu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LimitingConstraint {
    Convergence,
    Overvoltage,
    Undervoltage,
    Thermal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityPoint {
    pub capacity_kw: f64,
    pub converged: bool,
    pub voltage_violations: usize,
    pub min_voltage_pu: Option<f64>,
    pub max_voltage_pu: Option<f64>,
    pub max_line_loading_pct: Option<f64>,
    /// True when this step breaches a constraint relative to the baseline.
    pub has_violations: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationDetails {
    pub capacity_kw: f64,
    pub constraint: LimitingConstraint,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baseline {
    pub voltage_violations: usize,
    pub undervoltage_count: usize,
    pub overvoltage_count: usize,
    pub max_line_loading_pct: f64,
    pub min_voltage_pu: f64,
    pub max_voltage_pu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisParameters {
    pub increment_kw: f64,
    pub max_capacity_tested_kw: f64,
    pub iterations_performed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityResult {
    pub bus_id: String,
    pub der_type: DerKind,
    pub max_capacity_kw: f64,
    pub limiting_constraint: Option<LimitingConstraint>,
    pub violation_details: Option<ViolationDetails>,
    pub capacity_curve: Vec<CapacityPoint>,
    pub baseline: Baseline,
    pub constraints: CapacityConstraints,
    pub analysis_parameters: AnalysisParameters,
}

/// First constraint breached by `step`, judged against `baseline`.
fn breached(
    baseline: &GridSnapshot,
    step: &GridSnapshot,
    constraints: &CapacityConstraints,
) -> Option<(LimitingConstraint, String)> {
    if step.overvoltage_count > baseline.overvoltage_count {
        return Some((
            LimitingConstraint::Overvoltage,
            format!(
                "{} bus phases above {:.3} pu (baseline {}), max {:.4} pu",
                step.overvoltage_count, constraints.max_voltage_pu, baseline.overvoltage_count, step.max_voltage_pu
            ),
        ));
    }
    if step.undervoltage_count > baseline.undervoltage_count {
        return Some((
            LimitingConstraint::Undervoltage,
            format!(
                "{} bus phases below {:.3} pu (baseline {}), min {:.4} pu",
                step.undervoltage_count, constraints.min_voltage_pu, baseline.undervoltage_count, step.min_voltage_pu
            ),
        ));
    }
    if step.max_line_loading_pct > constraints.max_line_loading_pct
        && step.max_line_loading_pct > baseline.max_line_loading_pct
    {
        return Some((
            LimitingConstraint::Thermal,
            format!(
                "line loading {:.1}% exceeds {:.1}% limit",
                step.max_line_loading_pct, constraints.max_line_loading_pct
            ),
        ));
    }
    None
}

pub fn analyze_capacity(session: &mut Session, args: CapacityArgs) -> Result<ToolOutput<CapacityResult>, ToolError> {
    let circuit = session.circuit_name()?;
    let increment = args.increment_kw.unwrap_or(100.0);
    let max_capacity = args.max_capacity_kw.unwrap_or(10_000.0);
    if increment > max_capacity {
        return Err(ToolError::InvalidInput(format!(
            "increment_kw ({increment}) must not exceed max_capacity_kw ({max_capacity})"
        )));
    }
    let max_steps = session.config.analysis.max_capacity_steps;
    let steps = (max_capacity / increment).ceil();
    if steps > max_steps as f64 {
        return Err(ToolError::InvalidInput(format!(
            "max_capacity_kw / increment_kw requires {steps} steps, more than the limit of {max_steps}; \
             use a larger increment_kw"
        )));
    }
    let constraints = args.constraints.unwrap_or_else(|| CapacityConstraints {
        min_voltage_pu: session.config.analysis.min_voltage_pu,
        max_voltage_pu: session.config.analysis.max_voltage_pu,
        max_line_loading_pct: session.config.analysis.max_line_loading_pct,
    });
    if constraints.min_voltage_pu >= constraints.max_voltage_pu {
        return Err(ToolError::InvalidInput(
            "constraints.min_voltage_pu must be less than constraints.max_voltage_pu".to_string(),
        ));
    }
    let limits = constraints.voltage_limits();
    let options = session.default_solve_options();

    if !session.engine.topology()?.buses.iter().any(|b| b.name.eq_ignore_ascii_case(&args.bus_id)) {
        return Err(EngineError::UnknownBus(args.bus_id.clone()).into());
    }

    let report = session.engine.solve(&options)?;
    if !report.converged {
        return Err(ToolError::NotConverged);
    }
    let baseline = GridSnapshot::capture(session.engine.as_ref(), &limits)?;

    session
        .engine
        .add_der(&default_der(PROBE_NAME, &args.bus_id, args.der_type, increment))?;
    let sweep = sweep_capacity(session, &baseline, &constraints, increment, max_capacity);

    // restore the circuit whatever the sweep did
    session.engine.remove_der(PROBE_NAME)?;
    if let Err(e) = session.engine.solve(&options) {
        warn!(error = %e, "re-solving baseline after capacity sweep failed");
    }
    let (curve, limit) = sweep?;

    let max_capacity_kw = curve
        .iter()
        .filter(|p| !p.has_violations)
        .map(|p| p.capacity_kw)
        .fold(0.0, f64::max);
    let iterations = curve.len();
    let tested = curve.last().map(|p| p.capacity_kw).unwrap_or(0.0);

    info!(
        circuit = %circuit,
        bus = %args.bus_id,
        der_type = %args.der_type,
        max_capacity_kw,
        limiting = ?limit.as_ref().map(|l| l.constraint),
        steps = iterations,
        "hosting capacity analysis complete"
    );

    let result = CapacityResult {
        bus_id: args.bus_id.to_lowercase(),
        der_type: args.der_type,
        max_capacity_kw,
        limiting_constraint: limit.as_ref().map(|l| l.constraint),
        violation_details: limit,
        capacity_curve: curve,
        baseline: Baseline {
            voltage_violations: baseline.violation_count(),
            undervoltage_count: baseline.undervoltage_count,
            overvoltage_count: baseline.overvoltage_count,
            max_line_loading_pct: baseline.max_line_loading_pct,
            min_voltage_pu: baseline.min_voltage_pu,
            max_voltage_pu: baseline.max_voltage_pu,
        },
        constraints,
        analysis_parameters: AnalysisParameters {
            increment_kw: increment,
            max_capacity_tested_kw: tested,
            iterations_performed: iterations,
        },
    };
    session.results.capacity = Some(result.clone());
    Ok(ToolOutput::new(result, Metadata::new("hosting_capacity", Some(circuit))))
}

/// Step the probe DER up until a constraint is breached or the maximum is reached.
fn sweep_capacity(
    session: &mut Session,
    baseline: &GridSnapshot,
    constraints: &CapacityConstraints,
    increment: f64,
    max_capacity: f64,
) -> Result<(Vec<CapacityPoint>, Option<ViolationDetails>), ToolError> {
    let options = session.default_solve_options();
    let limits = constraints.voltage_limits();
    let mut curve = Vec::new();

    let mut step = 1usize;
    loop {
        let kw = increment * step as f64;
        if kw > max_capacity + 1e-9 {
            return Ok((curve, None));
        }
        session.engine.set_der_kw(PROBE_NAME, kw)?;
        let report = session.engine.solve(&options)?;

        if !report.converged {
            debug!(capacity_kw = kw, "capacity step did not converge");
            curve.push(CapacityPoint {
                capacity_kw: kw,
                converged: false,
                voltage_violations: 0,
                min_voltage_pu: None,
                max_voltage_pu: None,
                max_line_loading_pct: None,
                has_violations: true,
            });
            let details = ViolationDetails {
                capacity_kw: kw,
                constraint: LimitingConstraint::Convergence,
                description: format!("power flow did not converge at {kw} kW"),
            };
            return Ok((curve, Some(details)));
        }

        let snap = GridSnapshot::capture(session.engine.as_ref(), &limits)?;
        let breach = breached(baseline, &snap, constraints);
        debug!(
            capacity_kw = kw,
            max_voltage = snap.max_voltage_pu,
            loading = snap.max_line_loading_pct,
            breached = breach.is_some(),
            "capacity step"
        );
        curve.push(CapacityPoint {
            capacity_kw: kw,
            converged: true,
            voltage_violations: snap.violation_count(),
            min_voltage_pu: Some(snap.min_voltage_pu),
            max_voltage_pu: Some(snap.max_voltage_pu),
            max_line_loading_pct: Some(snap.max_line_loading_pct),
            has_violations: breach.is_some(),
        });
        if let Some((constraint, description)) = breach {
            return Ok((
                curve,
                Some(ViolationDetails {
                    capacity_kw: kw,
                    constraint,
                    description,
                }),
            ));
        }
        step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BusVoltage, MockCircuitEngine, PowerTotals, SolveReport, Topology, TopologyBus};
    use crate::tools::{feeder, parse};
    use serde_json::json;

    fn session(id: &str) -> Session {
        let mut session = Session::default();
        feeder::load_feeder(&mut session, parse(json!({ "feeder_id": id })).unwrap()).unwrap();
        session
    }

    fn snap(over: usize, under: usize, loading: f64) -> GridSnapshot {
        GridSnapshot {
            losses_kw: 0.0,
            min_voltage_pu: 0.97,
            max_voltage_pu: 1.04,
            undervoltage_count: under,
            overvoltage_count: over,
            max_line_loading_pct: loading,
        }
    }

    #[test]
    fn test_breach_is_relative_to_baseline() {
        let c = CapacityConstraints::default();
        assert!(breached(&snap(2, 0, 80.0), &snap(2, 0, 90.0), &c).is_none());
        assert_eq!(
            breached(&snap(2, 0, 80.0), &snap(3, 0, 90.0), &c).unwrap().0,
            LimitingConstraint::Overvoltage
        );
        assert_eq!(
            breached(&snap(0, 1, 80.0), &snap(0, 2, 90.0), &c).unwrap().0,
            LimitingConstraint::Undervoltage
        );
        assert_eq!(
            breached(&snap(0, 0, 80.0), &snap(0, 0, 101.0), &c).unwrap().0,
            LimitingConstraint::Thermal
        );
        // already overloaded before the DER, and not worse
        assert!(breached(&snap(0, 0, 120.0), &snap(0, 0, 110.0), &c).is_none());
    }

    #[test]
    fn test_overvoltage_order_wins() {
        let c = CapacityConstraints::default();
        let (kind, _) = breached(&snap(0, 0, 80.0), &snap(1, 1, 150.0), &c).unwrap();
        assert_eq!(kind, LimitingConstraint::Overvoltage);
    }

    #[test]
    fn test_ieee13_hosting_capacity() {
        let mut session = session("IEEE13");
        let args: CapacityArgs = parse(json!({
            "bus_id": "675",
            "der_type": "solar",
            "increment_kw": 500,
            "max_capacity_kw": 5000
        }))
        .unwrap();
        let out = analyze_capacity(&mut session, args).unwrap();
        let r = &out.data;
        assert!(r.max_capacity_kw >= 1000.0 && r.max_capacity_kw < 5000.0, "{}", r.max_capacity_kw);
        assert!(r.limiting_constraint.is_some());
        assert!(r.violation_details.is_some());
        assert_eq!(r.analysis_parameters.iterations_performed, r.capacity_curve.len());
        // only the last point may be infeasible
        let (last, rest) = r.capacity_curve.split_last().unwrap();
        assert!(last.has_violations);
        assert!(rest.iter().all(|p| !p.has_violations));
        assert_eq!(out.metadata.analysis_type, "hosting_capacity");

        assert_eq!(session.engine.summary().unwrap().num_ders, 0);
        assert!(session.engine.is_solved());
    }

    #[test]
    fn test_sweep_reaching_max_has_no_limit() {
        let mut session = session("IEEE13");
        let args: CapacityArgs = parse(json!({
            "bus_id": "675",
            "der_type": "solar",
            "increment_kw": 100,
            "max_capacity_kw": 300
        }))
        .unwrap();
        let out = analyze_capacity(&mut session, args).unwrap();
        assert_eq!(out.data.max_capacity_kw, 300.0);
        assert!(out.data.limiting_constraint.is_none());
        assert_eq!(out.data.capacity_curve.len(), 3);
    }

    #[test]
    fn test_unknown_bus() {
        let mut session = session("IEEE13");
        let args: CapacityArgs = parse(json!({"bus_id": "999", "der_type": "solar"})).unwrap();
        let err = analyze_capacity(&mut session, args).unwrap_err();
        assert_eq!(err.to_string(), "Bus '999' not found in circuit");
    }

    #[test]
    fn test_increment_above_max_rejected() {
        let mut session = session("IEEE13");
        let args: CapacityArgs = parse(json!({
            "bus_id": "675",
            "der_type": "wind",
            "increment_kw": 500,
            "max_capacity_kw": 100
        }))
        .unwrap();
        assert!(matches!(analyze_capacity(&mut session, args), Err(ToolError::InvalidInput(_))));
    }

    #[test]
    fn test_step_count_is_bounded() {
        let mut session = session("IEEE13");
        let args: CapacityArgs = parse(json!({
            "bus_id": "675",
            "der_type": "solar",
            "increment_kw": 0.0001,
            "max_capacity_kw": 100000
        }))
        .unwrap();
        let err = analyze_capacity(&mut session, args).unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
        assert!(err.to_string().contains("10000"), "{err}");
        assert_eq!(session.engine.summary().unwrap().num_ders, 0);

        session.config.analysis.max_capacity_steps = 5;
        let args: CapacityArgs = parse(json!({
            "bus_id": "675", "der_type": "solar", "increment_kw": 100, "max_capacity_kw": 600
        }))
        .unwrap();
        assert!(matches!(analyze_capacity(&mut session, args), Err(ToolError::InvalidInput(_))));
        let args: CapacityArgs = parse(json!({
            "bus_id": "675", "der_type": "solar", "increment_kw": 100, "max_capacity_kw": 500
        }))
        .unwrap();
        assert_eq!(analyze_capacity(&mut session, args).unwrap().data.capacity_curve.len(), 5);
    }

    fn report(converged: bool) -> SolveReport {
        SolveReport {
            converged,
            iterations: 5,
            control_iterations: 1,
            max_mismatch: if converged { 1e-6 } else { 0.5 },
        }
    }

    /// Engine with a single flat bus 675. The injected DER must be removed exactly once.
    fn flat_engine() -> MockCircuitEngine {
        let mut engine = MockCircuitEngine::new();
        engine.expect_circuit_name().returning(|| Some("IEEE13".to_string()));
        engine.expect_topology().returning(|| {
            Ok(Topology {
                source_bus: "sourcebus".to_string(),
                buses: vec![TopologyBus {
                    name: "675".to_string(),
                    kv_base: 2.4,
                    phases: vec![1, 2, 3],
                    depth: 4,
                    has_load: true,
                }],
                edges: vec![],
            })
        });
        engine.expect_bus_voltages().returning(|| {
            Ok(vec![BusVoltage {
                bus: "675".to_string(),
                phase: 1,
                magnitude_pu: 1.0,
                angle_deg: 0.0,
                kv_base: 2.4,
            }])
        });
        engine.expect_line_flows().returning(|| Ok(vec![]));
        engine.expect_losses().returning(|| Ok(PowerTotals::default()));
        engine.expect_add_der().returning(|_| Ok(()));
        engine.expect_set_der_kw().returning(|_, _| Ok(()));
        engine
            .expect_remove_der()
            .withf(|name| name == PROBE_NAME)
            .times(1)
            .returning(|_| Ok(()));
        engine
    }

    fn sweep_args() -> CapacityArgs {
        parse(json!({
            "bus_id": "675",
            "der_type": "solar",
            "increment_kw": 100,
            "max_capacity_kw": 1000
        }))
        .unwrap()
    }

    #[test]
    fn test_sweep_stops_at_divergence() {
        let mut engine = flat_engine();
        // baseline plus two feasible steps, then the solver gives up
        let mut solves = 0;
        engine.expect_solve().returning(move |_| {
            solves += 1;
            Ok(report(solves <= 3))
        });
        let mut session = Session::new(Box::new(engine), Default::default());

        let r = analyze_capacity(&mut session, sweep_args()).unwrap().data;
        assert_eq!(r.limiting_constraint, Some(LimitingConstraint::Convergence));
        assert_eq!(r.max_capacity_kw, 200.0);
        assert_eq!(r.capacity_curve.len(), 3);
        let last = r.capacity_curve.last().unwrap();
        assert!(!last.converged && last.has_violations);
        assert_eq!(r.violation_details.unwrap().capacity_kw, 300.0);
    }

    #[test]
    fn test_injected_der_removed_when_solver_fails() {
        let mut engine = flat_engine();
        let mut solves = 0;
        engine.expect_solve().returning(move |_| {
            solves += 1;
            if solves == 1 {
                Ok(report(true))
            } else {
                Err(EngineError::InvalidValue("singular system".to_string()))
            }
        });
        let mut session = Session::new(Box::new(engine), Default::default());

        let err = analyze_capacity(&mut session, sweep_args()).unwrap_err();
        assert!(err.to_string().contains("singular system"));
        assert!(session.results.capacity.is_none());
        // dropping the session checks the single remove_der call
    }

    #[test]
    fn test_invalid_der_type() {
        assert!(parse::<CapacityArgs>(json!({"bus_id": "675", "der_type": "nuclear"})).is_err());
    }
}
