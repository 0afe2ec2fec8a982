use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use super::{default_der, Metadata, ToolError, ToolOutput};
use crate::engine::{DerKind, FeederCatalog, LoadSpec};
use crate::session::Session;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoadFeederArgs {
    #[validate(length(min = 1))]
    pub feeder_id: String,
    #[serde(default)]
    #[validate(nested)]
    pub modifications: Option<Modifications>,
}

/// Changes applied on top of a template right after it is compiled.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Modifications {
    #[validate(range(exclusive_min = 0.0, max = 100.0))]
    pub load_multiplier: Option<f64>,
    #[validate(range(min = 0.9, max = 1.1))]
    pub source_voltage_pu: Option<f64>,
    #[serde(default)]
    #[validate(nested)]
    pub loads: Vec<AdditionalLoad>,
    #[serde(default)]
    #[validate(nested)]
    pub ders: Vec<AdditionalDer>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AdditionalLoad {
    pub name: Option<String>,
    #[validate(length(min = 1))]
    pub bus: String,
    #[validate(range(min = 0.0))]
    pub kw: f64,
    #[serde(default)]
    pub kvar: f64,
    #[serde(default)]
    pub phases: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AdditionalDer {
    pub name: Option<String>,
    #[validate(length(min = 1))]
    pub bus: String,
    pub der_type: DerKind,
    #[validate(range(min = 0.0))]
    pub kw: f64,
    #[serde(default)]
    pub kvar: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeederInfo {
    pub feeder_id: String,
    pub description: String,
    pub source_bus: String,
    pub num_buses: usize,
    pub num_lines: usize,
    pub num_loads: usize,
    pub num_transformers: usize,
    pub num_ders: usize,
    pub total_load_kw: f64,
    pub total_load_kvar: f64,
    pub voltage_bases_kv: Vec<f64>,
    pub feeder_length_km: f64,
    pub modifications_applied: Vec<String>,
}

pub fn load_feeder(session: &mut Session, args: LoadFeederArgs) -> Result<ToolOutput<FeederInfo>, ToolError> {
    let template = FeederCatalog::get(&args.feeder_id)?;

    session.engine.clear();
    session.results.clear();
    session.engine.compile(&template)?;

    let applied = match &args.modifications {
        Some(mods) => apply_modifications(session, mods),
        None => Ok(Vec::new()),
    };
    let applied = match applied {
        Ok(applied) => applied,
        Err(e) => {
            // leave no half-modified circuit behind
            warn!(feeder = %template.name, error = %e, "feeder modifications failed; circuit cleared");
            session.engine.clear();
            return Err(e);
        }
    };

    let summary = session.engine.summary()?;
    info!(
        feeder = %summary.name,
        buses = summary.num_buses,
        loads = summary.num_loads,
        modifications = applied.len(),
        "feeder loaded"
    );

    let info = FeederInfo {
        feeder_id: summary.name.clone(),
        description: template.description,
        source_bus: summary.source_bus,
        num_buses: summary.num_buses,
        num_lines: summary.num_lines,
        num_loads: summary.num_loads,
        num_transformers: summary.num_transformers,
        num_ders: summary.num_ders,
        total_load_kw: summary.total_load_kw,
        total_load_kvar: summary.total_load_kvar,
        voltage_bases_kv: summary.voltage_bases_kv,
        feeder_length_km: summary.feeder_length_km,
        modifications_applied: applied,
    };
    Ok(ToolOutput::new(info, Metadata::new("feeder_load", Some(summary.name))))
}

fn apply_modifications(session: &mut Session, mods: &Modifications) -> Result<Vec<String>, ToolError> {
    let mut applied = Vec::new();
    let engine = session.engine.as_mut();

    if let Some(multiplier) = mods.load_multiplier {
        engine.set_load_multiplier(multiplier)?;
        applied.push(format!("load_multiplier={multiplier}"));
    }
    if let Some(pu) = mods.source_voltage_pu {
        engine.set_source_pu(pu)?;
        applied.push(format!("source_voltage_pu={pu}"));
    }
    for (i, load) in mods.loads.iter().enumerate() {
        let name = load.name.clone().unwrap_or_else(|| format!("added_load_{}", i + 1));
        engine.add_load(&LoadSpec {
            name: name.clone(),
            bus: load.bus.clone(),
            phases: load.phases.clone(),
            kw: load.kw,
            kvar: load.kvar,
        })?;
        applied.push(format!("load {name} at bus {} ({} kW)", load.bus, load.kw));
    }
    for (i, der) in mods.ders.iter().enumerate() {
        let name = der
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_{}_{}", der.der_type, der.bus, i + 1));
        let mut spec = default_der(&name, &der.bus, der.der_type, der.kw);
        spec.kvar = der.kvar;
        engine.add_der(&spec)?;
        applied.push(format!("{} {name} at bus {} ({} kW)", der.der_type, der.bus, der.kw));
    }
    Ok(applied)
}
