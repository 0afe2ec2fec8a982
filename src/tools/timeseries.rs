use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use validator::Validate;

use super::snapshot::voltage_range;
use super::{Metadata, ToolError, ToolOutput};
use crate::session::Session;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoadProfile {
    #[serde(default = "default_profile_name")]
    pub name: String,
    /// Hourly multipliers, repeated when the run is longer than the profile.
    #[validate(length(min = 1, max = 8760))]
    pub multipliers: Vec<f64>,
}

fn default_profile_name() -> String {
    "custom".to_string()
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TimeSeriesArgs {
    #[validate(nested)]
    pub load_profile: LoadProfile,
    #[validate(range(exclusive_min = 0.0, max = 8760.0))]
    pub duration_hours: Option<f64>,
    #[validate(range(min = 1.0, max = 1440.0))]
    pub timestep_minutes: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeStep {
    pub timestep: usize,
    pub hour: f64,
    pub load_multiplier: f64,
    pub total_load_kw: f64,
    pub converged: bool,
    pub losses_kw: Option<f64>,
    pub min_voltage_pu: Option<f64>,
    pub max_voltage_pu: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesSummary {
    pub num_timesteps: usize,
    pub converged_steps: usize,
    pub avg_losses_kw: f64,
    pub total_energy_losses_kwh: f64,
    pub peak_load_kw: f64,
    pub min_voltage_pu: Option<f64>,
    pub max_voltage_pu: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesResult {
    pub profile_name: String,
    pub duration_hours: f64,
    pub timestep_minutes: f64,
    pub timesteps: Vec<TimeStep>,
    pub summary: TimeSeriesSummary,
}

/// Index into an hourly profile for a point in time.
pub fn profile_index(hour: f64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (hour.max(0.0).floor() as usize) % len
}

pub fn run_time_series(session: &mut Session, args: TimeSeriesArgs) -> Result<ToolOutput<TimeSeriesResult>, ToolError> {
    let circuit = session.circuit_name()?;
    let profile = &args.load_profile;
    if let Some(bad) = profile.multipliers.iter().find(|m| !m.is_finite() || **m < 0.0) {
        return Err(ToolError::InvalidInput(format!(
            "load profile multipliers must be finite and non-negative (got {bad})"
        )));
    }
    let duration = args.duration_hours.unwrap_or(24.0);
    let step_minutes = args.timestep_minutes.unwrap_or(60.0);
    let steps = ((duration * 60.0 / step_minutes).floor() as usize).max(1);
    let dt_hours = step_minutes / 60.0;

    let original = session.engine.load_multiplier();
    let options = session.default_solve_options();
    let run = simulate(session, profile, steps, dt_hours, original, &options);

    // restore the base load level even when a step failed hard
    session.engine.set_load_multiplier(original)?;
    if let Err(e) = session.engine.solve(&options) {
        warn!(error = %e, "re-solving base case after time series failed");
    }
    let timesteps = run?;

    let converged: Vec<&TimeStep> = timesteps.iter().filter(|s| s.converged).collect();
    let total_losses_kwh: f64 = converged.iter().filter_map(|s| s.losses_kw).map(|kw| kw * dt_hours).sum();
    let summary = TimeSeriesSummary {
        num_timesteps: timesteps.len(),
        converged_steps: converged.len(),
        avg_losses_kw: if converged.is_empty() {
            0.0
        } else {
            converged.iter().filter_map(|s| s.losses_kw).sum::<f64>() / converged.len() as f64
        },
        total_energy_losses_kwh: total_losses_kwh,
        peak_load_kw: timesteps.iter().map(|s| s.total_load_kw).fold(0.0, f64::max),
        min_voltage_pu: converged.iter().filter_map(|s| s.min_voltage_pu).reduce(f64::min),
        max_voltage_pu: converged.iter().filter_map(|s| s.max_voltage_pu).reduce(f64::max),
    };

    info!(
        circuit = %circuit,
        profile = %profile.name,
        steps = summary.num_timesteps,
        converged = summary.converged_steps,
        energy_losses_kwh = summary.total_energy_losses_kwh,
        "time series complete"
    );

    let result = TimeSeriesResult {
        profile_name: profile.name.clone(),
        duration_hours: duration,
        timestep_minutes: step_minutes,
        timesteps,
        summary,
    };
    session.results.timeseries = Some(result.clone());
    Ok(ToolOutput::new(result, Metadata::new("timeseries", Some(circuit))))
}

fn simulate(
    session: &mut Session,
    profile: &LoadProfile,
    steps: usize,
    dt_hours: f64,
    base_multiplier: f64,
    options: &crate::engine::SolveOptions,
) -> Result<Vec<TimeStep>, ToolError> {
    let mut out = Vec::with_capacity(steps);
    for k in 0..steps {
        let hour = k as f64 * dt_hours;
        let multiplier = profile.multipliers[profile_index(hour, profile.multipliers.len())];
        session.engine.set_load_multiplier(base_multiplier * multiplier)?;
        let total_load_kw = session.engine.summary()?.total_load_kw;
        let report = session.engine.solve(options)?;

        let step = if report.converged {
            let (min, max) = voltage_range(&session.engine.bus_voltages()?);
            TimeStep {
                timestep: k,
                hour,
                load_multiplier: multiplier,
                total_load_kw,
                converged: true,
                losses_kw: Some(session.engine.losses()?.kw),
                min_voltage_pu: Some(min),
                max_voltage_pu: Some(max),
            }
        } else {
            warn!(timestep = k, hour, multiplier, "time step did not converge");
            TimeStep {
                timestep: k,
                hour,
                load_multiplier: multiplier,
                total_load_kw,
                converged: false,
                losses_kw: None,
                min_voltage_pu: None,
                max_voltage_pu: None,
            }
        };
        debug!(timestep = k, converged = step.converged, "time step solved");
        out.push(step);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{feeder, parse};
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(0.0, 24, 0)]
    #[case(0.5, 24, 0)]
    #[case(23.99, 24, 23)]
    #[case(24.0, 24, 0)]
    #[case(30.0, 24, 6)]
    #[case(5.0, 1, 0)]
    fn test_profile_index(#[case] hour: f64, #[case] len: usize, #[case] expected: usize) {
        assert_eq!(profile_index(hour, len), expected);
    }

    fn session() -> Session {
        let mut session = Session::default();
        feeder::load_feeder(
            &mut session,
            parse(json!({"feeder_id": "IEEE13", "modifications": {"load_multiplier": 0.8}})).unwrap(),
        )
        .unwrap();
        session
    }

    #[test]
    fn test_daily_run_restores_multiplier() {
        let mut session = session();
        let args: TimeSeriesArgs = parse(json!({
            "load_profile": {"name": "flat_low_high", "multipliers": [0.5, 1.0]},
            "duration_hours": 4,
            "timestep_minutes": 60
        }))
        .unwrap();
        let out = run_time_series(&mut session, args).unwrap();
        let r = &out.data;
        assert_eq!(r.timesteps.len(), 4);
        assert_eq!(r.summary.num_timesteps, 4);
        assert_eq!(r.summary.converged_steps, 4);
        let multipliers: Vec<f64> = r.timesteps.iter().map(|s| s.load_multiplier).collect();
        assert_eq!(multipliers, vec![0.5, 1.0, 0.5, 1.0]);
        // high step carries more load and more losses than the low one
        assert!(r.timesteps[1].total_load_kw > r.timesteps[0].total_load_kw);
        assert!(r.timesteps[1].losses_kw > r.timesteps[0].losses_kw);
        assert!((r.summary.peak_load_kw - 3466.0 * 0.8).abs() < 1e-6);
        assert!(r.summary.total_energy_losses_kwh > 0.0);

        assert_eq!(session.engine.load_multiplier(), 0.8);
        assert!(session.results.timeseries.is_some());
    }

    #[test]
    fn test_sub_hourly_steps() {
        let mut session = session();
        let args: TimeSeriesArgs = parse(json!({
            "load_profile": {"multipliers": [1.0, 0.6]},
            "duration_hours": 2,
            "timestep_minutes": 30
        }))
        .unwrap();
        let out = run_time_series(&mut session, args).unwrap();
        let hours: Vec<f64> = out.data.timesteps.iter().map(|s| s.hour).collect();
        assert_eq!(hours, vec![0.0, 0.5, 1.0, 1.5]);
        let multipliers: Vec<f64> = out.data.timesteps.iter().map(|s| s.load_multiplier).collect();
        assert_eq!(multipliers, vec![1.0, 1.0, 0.6, 0.6]);
        assert_eq!(out.data.profile_name, "custom");
    }

    #[test]
    fn test_empty_profile_rejected() {
        assert!(parse::<TimeSeriesArgs>(json!({"load_profile": {"multipliers": []}})).is_err());
    }

    #[test]
    fn test_negative_multiplier_rejected() {
        let mut session = session();
        let args: TimeSeriesArgs = parse(json!({"load_profile": {"multipliers": [1.0, -0.2]}})).unwrap();
        assert!(matches!(run_time_series(&mut session, args), Err(ToolError::InvalidInput(_))));
    }
}
