use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Standard volt-var characteristics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum VoltVarPreset {
    /// IEEE 1547-2018 Category B default settings.
    #[default]
    #[serde(rename = "IEEE1547")]
    #[strum(serialize = "IEEE1547")]
    Ieee1547,
    /// California Rule 21 default settings.
    #[serde(rename = "RULE21")]
    #[strum(serialize = "RULE21")]
    Rule21,
}

impl VoltVarPreset {
    /// (voltage pu, reactive output as a fraction of kVA). Positive injects vars.
    pub fn points(self) -> Vec<(f64, f64)> {
        match self {
            VoltVarPreset::Ieee1547 => vec![(0.92, 0.44), (0.98, 0.0), (1.02, 0.0), (1.08, -0.44)],
            VoltVarPreset::Rule21 => vec![(0.92, 0.30), (0.967, 0.0), (1.033, 0.0), (1.07, -0.30)],
        }
    }
}

/// Piecewise-linear volt-var characteristic, flat beyond its end points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltVarCurve {
    pub preset: VoltVarPreset,
    pub points: Vec<(f64, f64)>,
    /// Open-loop response time in seconds. Reported only; snapshot solutions
    /// settle to the steady state.
    pub response_time_s: f64,
}

impl VoltVarCurve {
    pub fn from_preset(preset: VoltVarPreset, response_time_s: f64) -> Self {
        Self {
            preset,
            points: preset.points(),
            response_time_s,
        }
    }

    /// Reactive output as a fraction of the inverter rating at `voltage_pu`.
    pub fn q_fraction(&self, voltage_pu: f64) -> f64 {
        let Some(&(v_first, q_first)) = self.points.first() else {
            return 0.0;
        };
        if voltage_pu <= v_first {
            return q_first;
        }
        for pair in self.points.windows(2) {
            let (v0, q0) = pair[0];
            let (v1, q1) = pair[1];
            if voltage_pu <= v1 {
                if (v1 - v0).abs() < f64::EPSILON {
                    return q1;
                }
                return q0 + (q1 - q0) * (voltage_pu - v0) / (v1 - v0);
            }
        }
        self.points.last().map(|&(_, q)| q).unwrap_or(0.0)
    }
}

impl Default for VoltVarCurve {
    fn default() -> Self {
        Self::from_preset(VoltVarPreset::default(), 10.0)
    }
}

/// Harmonic current spectrum as (order, magnitude relative to fundamental).
pub type Spectrum = &'static [(u32, f64)];

/// Rectifier-type load spectrum.
pub const LOAD_SPECTRUM: Spectrum = &[
    (3, 0.015),
    (5, 0.20),
    (7, 0.143),
    (9, 0.01),
    (11, 0.091),
    (13, 0.077),
    (15, 0.008),
    (17, 0.059),
    (19, 0.053),
    (21, 0.006),
    (23, 0.043),
    (25, 0.040),
];

/// Grid-following inverter spectrum.
pub const INVERTER_SPECTRUM: Spectrum = &[
    (3, 0.02),
    (5, 0.03),
    (7, 0.025),
    (9, 0.005),
    (11, 0.015),
    (13, 0.01),
];

pub fn spectrum_magnitude(spectrum: Spectrum, order: u32) -> f64 {
    if order == 1 {
        return 1.0;
    }
    spectrum
        .iter()
        .find(|(h, _)| *h == order)
        .map(|(_, m)| *m)
        .unwrap_or(0.0)
}
