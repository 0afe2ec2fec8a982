//! Predefined feeder templates.
//!
//! Templates are TOML documents compiled into the binary. They describe a
//! positive-sequence, per-phase approximation of the IEEE distribution test
//! feeders: linecodes carry sequence impedances and single-phase laterals are
//! kept on their original phase.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::EngineError;
use super::types::LoadSpec;

const BUILTIN: &[(&str, &str)] = &[
    ("IEEE13", include_str!("../../feeders/ieee13.toml")),
    ("IEEE34", include_str!("../../feeders/ieee34.toml")),
    ("IEEE123", include_str!("../../feeders/ieee123.toml")),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    #[default]
    Ft,
    Kft,
    Mi,
    M,
    Km,
}

impl LengthUnit {
    pub fn to_km(self, value: f64) -> f64 {
        match self {
            LengthUnit::Ft => value * 0.0003048,
            LengthUnit::Kft => value * 0.3048,
            LengthUnit::Mi => value * 1.609344,
            LengthUnit::M => value / 1000.0,
            LengthUnit::Km => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDef {
    pub bus: String,
    pub kv: f64,
    #[serde(default = "default_source_pu")]
    pub pu: f64,
    /// Three-phase short-circuit level at the source bus.
    #[serde(default = "default_mvasc")]
    pub mvasc3: f64,
    #[serde(default = "default_x_r")]
    pub x_r_ratio: f64,
}

fn default_source_pu() -> f64 {
    1.0
}

fn default_mvasc() -> f64 {
    2000.0
}

fn default_x_r() -> f64 {
    4.0
}

/// Sequence impedance per unit length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineCode {
    pub r1: f64,
    pub x1: f64,
    pub units: LengthUnit,
    pub norm_amps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineDef {
    pub name: String,
    pub from: String,
    pub to: String,
    #[serde(default = "three_phase")]
    pub phases: Vec<u8>,
    #[serde(default)]
    pub length: f64,
    #[serde(default)]
    pub linecode: Option<String>,
    #[serde(default)]
    pub switch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerDef {
    pub name: String,
    pub from: String,
    pub to: String,
    pub kva: f64,
    pub kv_high: f64,
    pub kv_low: f64,
    #[serde(default = "default_r_pct")]
    pub r_pct: f64,
    #[serde(default = "default_x_pct")]
    pub x_pct: f64,
    /// Fixed per-phase tap ratios (secondary over primary, per unit).
    #[serde(default)]
    pub taps: Option<Vec<f64>>,
    #[serde(default)]
    pub regulator: bool,
}

fn default_r_pct() -> f64 {
    1.0
}

fn default_x_pct() -> f64 {
    6.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacitorDef {
    pub name: String,
    pub bus: String,
    #[serde(default = "three_phase")]
    pub phases: Vec<u8>,
    pub kvar: f64,
}

fn three_phase() -> Vec<u8> {
    vec![1, 2, 3]
}

/// A compiled-in circuit description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Unit for line lengths in this template.
    #[serde(default)]
    pub length_units: LengthUnit,
    pub source: SourceDef,
    #[serde(default)]
    pub linecodes: BTreeMap<String, LineCode>,
    #[serde(default)]
    pub lines: Vec<LineDef>,
    #[serde(default)]
    pub transformers: Vec<TransformerDef>,
    #[serde(default)]
    pub loads: Vec<LoadSpec>,
    #[serde(default)]
    pub capacitors: Vec<CapacitorDef>,
}

impl FeederTemplate {
    pub fn from_toml(text: &str) -> Result<Self, EngineError> {
        let template: FeederTemplate = toml::from_str(text)?;
        template.check_linecodes()?;
        Ok(template)
    }

    fn check_linecodes(&self) -> Result<(), EngineError> {
        for line in &self.lines {
            match &line.linecode {
                Some(code) if !self.linecodes.contains_key(code) => {
                    return Err(EngineError::InvalidTemplate(format!(
                        "line '{}' references unknown linecode '{}'",
                        line.name, code
                    )));
                }
                None if !line.switch => {
                    return Err(EngineError::InvalidTemplate(format!(
                        "line '{}' has no linecode",
                        line.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Lookup of predefined feeders by case-insensitive id.
#[derive(Debug, Clone, Default)]
pub struct FeederCatalog;

impl FeederCatalog {
    pub fn ids() -> Vec<String> {
        BUILTIN.iter().map(|(id, _)| id.to_string()).collect()
    }

    /// Canonical id for `requested`, if it names a predefined feeder.
    pub fn canonical_id(requested: &str) -> Option<&'static str> {
        BUILTIN
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(requested.trim()))
            .map(|(id, _)| *id)
    }

    pub fn get(requested: &str) -> Result<FeederTemplate, EngineError> {
        let (_, text) = BUILTIN
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(requested.trim()))
            .ok_or_else(|| EngineError::UnknownFeeder {
                requested: requested.to_string(),
                available: Self::ids(),
            })?;
        FeederTemplate::from_toml(text)
    }
}
