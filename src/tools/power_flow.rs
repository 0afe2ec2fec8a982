use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use validator::Validate;

use super::snapshot::voltage_range;
use super::{ensure_feeder, Metadata, ToolError, ToolOutput};
use crate::engine::{SolutionMode, SolveOptions};
use crate::session::Session;

pub const MAX_HARMONIC_ORDER: u32 = 50;

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct PowerFlowArgs {
    pub feeder_id: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub options: PowerFlowOptions,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct PowerFlowOptions {
    #[validate(range(min = 1, max = 1000))]
    pub max_iterations: Option<u32>,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub tolerance: Option<f64>,
    pub control_mode: Option<String>,
    #[serde(default)]
    pub harmonic_analysis: bool,
    pub harmonic_orders: Option<Vec<u32>>,
}

/// Options as actually applied, echoed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedOptions {
    pub max_iterations: u32,
    pub tolerance: f64,
    pub control_mode: SolutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harmonic_analysis: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harmonic_orders: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerFlowResult {
    pub feeder_id: String,
    pub converged: bool,
    pub iterations: u32,
    pub control_iterations: u32,
    /// Bus name to first-phase magnitude in per-unit.
    pub bus_voltages: BTreeMap<String, f64>,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub total_losses_kw: f64,
    pub total_losses_kvar: f64,
    pub options: AppliedOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harmonics: Option<HarmonicsReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarmonicsReport {
    pub harmonic_orders: Vec<u32>,
    /// Bus name to voltage THD in percent.
    pub thd_voltage: BTreeMap<String, f64>,
    /// Line name to current THD in percent.
    pub thd_current: BTreeMap<String, f64>,
    /// Order to bus to per-unit voltage magnitude.
    pub individual_harmonics: BTreeMap<u32, BTreeMap<String, f64>>,
    pub worst_thd_bus: Option<String>,
    pub worst_thd_value: f64,
}

pub fn run_power_flow(session: &mut Session, args: PowerFlowArgs) -> Result<ToolOutput<PowerFlowResult>, ToolError> {
    let feeder_id = ensure_feeder(session, args.feeder_id.as_deref())?;
    let opts = &args.options;

    let mode = match opts.control_mode.as_deref() {
        None => SolutionMode::Snapshot,
        Some(name) => name.parse::<SolutionMode>().unwrap_or_else(|_| {
            warn!(control_mode = name, "unrecognized control mode, using snapshot");
            SolutionMode::Snapshot
        }),
    };
    let defaults = session.default_solve_options();
    let solve_options = SolveOptions::default()
        .with_max_iterations(opts.max_iterations.unwrap_or(defaults.max_iterations))
        .with_tolerance(opts.tolerance.unwrap_or(defaults.tolerance))
        .with_mode(mode);

    let orders = if opts.harmonic_analysis {
        Some(harmonic_orders(
            opts.harmonic_orders
                .clone()
                .unwrap_or_else(|| session.config.analysis.harmonic_orders.clone()),
        )?)
    } else {
        None
    };

    session.results.power_flow = None;
    let report = session.engine.solve(&solve_options)?;
    if !report.converged {
        warn!(
            feeder = %feeder_id,
            iterations = report.iterations,
            mismatch = report.max_mismatch,
            "power flow did not converge"
        );
        return Err(ToolError::NotConverged);
    }

    let voltages = session.engine.bus_voltages()?;
    let losses = session.engine.losses()?;
    let (min_voltage, max_voltage) = voltage_range(&voltages);
    let mut bus_voltages = BTreeMap::new();
    for v in &voltages {
        bus_voltages.entry(v.bus.to_lowercase()).or_insert(v.magnitude_pu);
    }

    let harmonics = match &orders {
        Some(orders) => {
            let report = harmonics_report(session, orders)?;
            session.results.harmonics = Some(report.clone());
            Some(report)
        }
        None => None,
    };

    info!(
        feeder = %feeder_id,
        iterations = report.iterations,
        min_voltage,
        max_voltage,
        losses_kw = losses.kw,
        harmonics = harmonics.is_some(),
        "power flow solved"
    );

    let result = PowerFlowResult {
        feeder_id: feeder_id.clone(),
        converged: true,
        iterations: report.iterations,
        control_iterations: report.control_iterations,
        bus_voltages,
        min_voltage,
        max_voltage,
        total_losses_kw: losses.kw,
        total_losses_kvar: losses.kvar,
        options: AppliedOptions {
            max_iterations: solve_options.max_iterations,
            tolerance: solve_options.tolerance,
            control_mode: mode,
            harmonic_analysis: orders.as_ref().map(|_| true),
            harmonic_orders: orders,
        },
        harmonics,
    };
    session.results.power_flow = Some(result.clone());

    let analysis_type = if result.harmonics.is_some() {
        "power_flow_harmonics"
    } else {
        "power_flow"
    };
    Ok(ToolOutput::new(result, Metadata::new(analysis_type, Some(feeder_id))))
}

/// Sorted, deduplicated orders within 1..=50.
fn harmonic_orders(mut orders: Vec<u32>) -> Result<Vec<u32>, ToolError> {
    if orders.is_empty() {
        return Err(ToolError::InvalidInput("harmonic_orders must not be empty".to_string()));
    }
    if let Some(bad) = orders.iter().find(|&&h| h == 0 || h > MAX_HARMONIC_ORDER) {
        return Err(ToolError::InvalidInput(format!(
            "Harmonic order {bad} is out of range (1-{MAX_HARMONIC_ORDER})"
        )));
    }
    orders.sort_unstable();
    orders.dedup();
    Ok(orders)
}

fn harmonics_report(session: &mut Session, orders: &[u32]) -> Result<HarmonicsReport, ToolError> {
    let solution = session.engine.solve_harmonics(orders)?;

    let thd_voltage = thd_by_element(&solution.voltages);
    let thd_current = thd_by_element(&solution.currents);
    let worst = thd_voltage
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(bus, thd)| (bus.clone(), *thd));

    Ok(HarmonicsReport {
        harmonic_orders: orders.to_vec(),
        thd_voltage,
        thd_current,
        individual_harmonics: solution.voltages,
        worst_thd_bus: worst.as_ref().map(|(bus, _)| bus.clone()),
        worst_thd_value: worst.map(|(_, thd)| thd).unwrap_or(0.0),
    })
}

/// Regroup order→element→magnitude into element→THD.
fn thd_by_element(by_order: &BTreeMap<u32, BTreeMap<String, f64>>) -> BTreeMap<String, f64> {
    let mut spectra: BTreeMap<&str, BTreeMap<u32, f64>> = BTreeMap::new();
    for (order, values) in by_order {
        for (element, magnitude) in values {
            spectra.entry(element.as_str()).or_default().insert(*order, *magnitude);
        }
    }
    spectra
        .into_iter()
        .map(|(element, spectrum)| (element.to_string(), calculate_thd(&spectrum)))
        .collect()
}

/// Total harmonic distortion in percent: sqrt(Σ H_n², n > 1) / H_1 × 100.
///
/// Returns 0 when the fundamental is absent or non-positive, or when nothing
/// above it is present.
pub fn calculate_thd(spectrum: &BTreeMap<u32, f64>) -> f64 {
    let fundamental = match spectrum.get(&1) {
        Some(&h1) if h1 > 0.0 => h1,
        _ => return 0.0,
    };
    let sum_sq: f64 = spectrum
        .iter()
        .filter(|(order, _)| **order > 1)
        .map(|(_, m)| m * m)
        .sum();
    sum_sq.sqrt() / fundamental * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, MockCircuitEngine, SolveReport};
    use crate::tools::{feeder, parse};
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    fn spectrum(pairs: &[(u32, f64)]) -> BTreeMap<u32, f64> {
        pairs.iter().copied().collect()
    }

    #[rstest]
    #[case(&[(1, 120.0), (3, 10.0), (5, 8.0), (7, 5.0)], 11.4564)]
    #[case(&[(1, 100.0), (3, 50.0), (5, 30.0), (7, 20.0), (9, 10.0)], 62.4500)]
    #[case(&[(1, 100.0)], 0.0)]
    #[case(&[(3, 10.0), (5, 5.0)], 0.0)]
    #[case(&[(1, 0.0), (3, 10.0)], 0.0)]
    #[case(&[(1, -5.0), (3, 10.0)], 0.0)]
    fn test_calculate_thd(#[case] pairs: &[(u32, f64)], #[case] expected: f64) {
        let thd = calculate_thd(&spectrum(pairs));
        assert!((thd - expected).abs() < 1e-3, "got {thd}");
    }

    proptest! {
        #[test]
        fn thd_is_non_negative_and_scale_free(
            h1 in 0.1f64..1000.0,
            harmonics in proptest::collection::vec(0.0f64..100.0, 0..10),
            scale in 0.1f64..10.0,
        ) {
            let mut s = BTreeMap::from([(1, h1)]);
            for (i, m) in harmonics.iter().enumerate() {
                s.insert(2 * i as u32 + 3, *m);
            }
            let thd = calculate_thd(&s);
            prop_assert!(thd >= 0.0);
            let scaled: BTreeMap<u32, f64> = s.iter().map(|(k, v)| (*k, v * scale)).collect();
            prop_assert!((calculate_thd(&scaled) - thd).abs() <= 1e-6 * thd.max(1.0));
        }
    }

    #[test]
    fn test_order_validation() {
        assert_eq!(harmonic_orders(vec![7, 1, 5, 5]).unwrap(), vec![1, 5, 7]);
        assert!(harmonic_orders(vec![1, 51]).is_err());
        assert!(harmonic_orders(vec![0]).is_err());
        assert!(harmonic_orders(vec![]).is_err());
    }

    fn loaded(id: &str) -> Session {
        let mut session = Session::default();
        feeder::load_feeder(&mut session, parse(json!({ "feeder_id": id })).unwrap()).unwrap();
        session
    }

    #[test]
    fn test_ieee13_power_flow() {
        let mut session = loaded("IEEE13");
        let out = run_power_flow(&mut session, PowerFlowArgs::default()).unwrap();
        let r = &out.data;
        assert!(r.converged);
        assert_eq!(r.bus_voltages.len(), 16);
        assert!(r.min_voltage <= r.max_voltage);
        assert!(r.bus_voltages.values().all(|v| *v >= r.min_voltage && *v <= r.max_voltage));
        assert!(r.total_losses_kw > 0.0);
        assert!(r.harmonics.is_none());
        assert!(r.options.harmonic_orders.is_none());
        assert!(session.results.power_flow.is_some());
    }

    #[test]
    fn test_harmonic_power_flow() {
        let mut session = loaded("IEEE13");
        let args: PowerFlowArgs = parse(json!({
            "options": {"harmonic_analysis": true, "harmonic_orders": [1, 3, 5, 7]}
        }))
        .unwrap();
        let out = run_power_flow(&mut session, args).unwrap();
        let h = out.data.harmonics.as_ref().unwrap();
        assert_eq!(h.harmonic_orders, vec![1, 3, 5, 7]);
        assert_eq!(h.individual_harmonics.len(), 4);
        let worst = h.worst_thd_bus.as_ref().unwrap();
        assert_eq!(h.thd_voltage[worst], h.worst_thd_value);
        assert!(h.thd_voltage.values().all(|t| *t >= 0.0 && *t <= h.worst_thd_value));
        assert_eq!(out.metadata.analysis_type, "power_flow_harmonics");
        assert_eq!(out.data.options.harmonic_analysis, Some(true));
        assert!(session.results.harmonics.is_some());
    }

    #[test]
    fn test_feeder_mismatch() {
        let mut session = loaded("IEEE13");
        let args: PowerFlowArgs = parse(json!({"feeder_id": "IEEE34"})).unwrap();
        assert!(matches!(
            run_power_flow(&mut session, args),
            Err(ToolError::FeederMismatch { .. })
        ));
        let args: PowerFlowArgs = parse(json!({"feeder_id": "ieee13"})).unwrap();
        assert!(run_power_flow(&mut session, args).is_ok());
    }

    #[test]
    fn test_unknown_control_mode_falls_back() {
        let mut session = loaded("IEEE13");
        let args: PowerFlowArgs = parse(json!({"options": {"control_mode": "weekly"}})).unwrap();
        let out = run_power_flow(&mut session, args).unwrap();
        assert_eq!(out.data.options.control_mode, SolutionMode::Snapshot);
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(parse::<PowerFlowArgs>(json!({"options": {"max_iterations": 0}})).is_err());
        assert!(parse::<PowerFlowArgs>(json!({"options": {"tolerance": 0.0}})).is_err());
    }

    #[test]
    fn test_non_convergence_reported() {
        let mut engine = MockCircuitEngine::new();
        engine.expect_circuit_name().returning(|| Some("IEEE13".to_string()));
        engine.expect_solve().returning(|_| {
            Ok(SolveReport {
                converged: false,
                iterations: 100,
                control_iterations: 1,
                max_mismatch: 0.2,
            })
        });
        let mut session = Session::new(Box::new(engine), Default::default());
        let err = run_power_flow(&mut session, PowerFlowArgs::default()).unwrap_err();
        assert_eq!(err.to_string(), "Power flow did not converge");
        assert!(session.results.power_flow.is_none());
    }

    #[test]
    fn test_engine_failure_propagates() {
        let mut engine = MockCircuitEngine::new();
        engine.expect_circuit_name().returning(|| Some("IEEE13".to_string()));
        engine
            .expect_solve()
            .returning(|_| Err(EngineError::InvalidValue("singular".to_string())));
        let mut session = Session::new(Box::new(engine), Default::default());
        let err = run_power_flow(&mut session, PowerFlowArgs::default()).unwrap_err();
        assert!(err.to_string().contains("singular"));
    }
}
