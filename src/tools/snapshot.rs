use serde::{Deserialize, Serialize};

use crate::engine::{BusVoltage, CircuitEngine, EngineError};

/// Voltage band used to classify bus phases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageLimits {
    pub min_voltage_pu: f64,
    pub max_voltage_pu: f64,
}

impl Default for VoltageLimits {
    fn default() -> Self {
        Self {
            min_voltage_pu: 0.95,
            max_voltage_pu: 1.05,
        }
    }
}

impl VoltageLimits {
    pub fn is_under(&self, v: f64) -> bool {
        v < self.min_voltage_pu
    }

    pub fn is_over(&self, v: f64) -> bool {
        v > self.max_voltage_pu
    }

    /// Room left before the nearest limit; negative when outside the band.
    pub fn headroom(&self, v: f64) -> f64 {
        (v - self.min_voltage_pu).min(self.max_voltage_pu - v)
    }
}

/// Condensed state of a solved circuit, used to compare scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridSnapshot {
    pub losses_kw: f64,
    pub min_voltage_pu: f64,
    pub max_voltage_pu: f64,
    pub undervoltage_count: usize,
    pub overvoltage_count: usize,
    pub max_line_loading_pct: f64,
}

impl GridSnapshot {
    /// Summarize the engine's current solution.
    pub fn capture(engine: &dyn CircuitEngine, limits: &VoltageLimits) -> Result<Self, EngineError> {
        let voltages = engine.bus_voltages()?;
        let flows = engine.line_flows()?;
        let losses = engine.losses()?;
        let (min, max) = voltage_range(&voltages);
        Ok(Self {
            losses_kw: losses.kw,
            min_voltage_pu: min,
            max_voltage_pu: max,
            undervoltage_count: voltages.iter().filter(|v| limits.is_under(v.magnitude_pu)).count(),
            overvoltage_count: voltages.iter().filter(|v| limits.is_over(v.magnitude_pu)).count(),
            max_line_loading_pct: flows.iter().map(|f| f.loading_pct).fold(0.0, f64::max),
        })
    }

    pub fn violation_count(&self) -> usize {
        self.undervoltage_count + self.overvoltage_count
    }
}

/// (min, max) magnitude over all bus phases; (0, 0) when empty.
pub fn voltage_range(voltages: &[BusVoltage]) -> (f64, f64) {
    if voltages.is_empty() {
        return (0.0, 0.0);
    }
    voltages.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v.magnitude_pu), hi.max(v.magnitude_pu))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bv(bus: &str, v: f64) -> BusVoltage {
        BusVoltage {
            bus: bus.to_string(),
            phase: 1,
            magnitude_pu: v,
            angle_deg: 0.0,
            kv_base: 4.16,
        }
    }

    #[test]
    fn test_limits() {
        let limits = VoltageLimits::default();
        assert!(limits.is_under(0.94));
        assert!(!limits.is_under(0.95));
        assert!(limits.is_over(1.051));
        assert!((limits.headroom(1.0) - 0.05).abs() < 1e-12);
        assert!(limits.headroom(1.06) < 0.0);
    }

    #[test]
    fn test_voltage_range() {
        assert_eq!(voltage_range(&[]), (0.0, 0.0));
        let (lo, hi) = voltage_range(&[bv("a", 1.01), bv("b", 0.97), bv("c", 1.03)]);
        assert_eq!((lo, hi), (0.97, 1.03));
    }
}
