//! Per-phase backward/forward sweep for radial feeders.
//!
//! Phases are solved without mutual coupling on a 1 MVA three-phase base.
//! Loads and DERs are constant power, capacitors constant impedance. Volt-var
//! DERs are settled by an outer control loop around the sweep.

use num_complex::Complex64;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

use super::control::{spectrum_magnitude, INVERTER_SPECTRUM, LOAD_SPECTRUM};
use super::error::EngineError;
use super::feeders::{FeederTemplate, LineDef, TransformerDef};
use super::types::*;
use super::CircuitEngine;

const SYSTEM_BASE_KVA: f64 = 1000.0;
const PHASE_BASE_KVA: f64 = SYSTEM_BASE_KVA / 3.0;
const PHASE_ANGLES_DEG: [f64; 3] = [0.0, -120.0, 120.0];

const SWITCH_IMPEDANCE_PU: f64 = 1e-5;
const SWITCH_NORMAL_AMPS: f64 = 1000.0;

/// Below this magnitude the sweep is treated as diverged.
const COLLAPSE_VOLTAGE_PU: f64 = 0.3;

const MAX_CONTROL_PASSES: u32 = 20;
const CONTROL_DAMPING: f64 = 0.5;
/// Control loop settles when every volt-var DER moves less than this
/// fraction of its rating.
const CONTROL_TOLERANCE: f64 = 0.001;

/// Inverter rating assumed for DERs that do not state one.
const DEFAULT_KVA_PER_KW: f64 = 1.0;

type Phasors = [Complex64; 3];

const ZERO: Phasors = [Complex64::new(0.0, 0.0); 3];

#[derive(Debug, Clone)]
struct Bus {
    name: String,
    kv_base: f64,
    phases: Vec<u8>,
    /// Branch feeding this bus (`None` for the source bus).
    feeder: Option<usize>,
    children: Vec<usize>,
    depth: usize,
}

#[derive(Debug, Clone)]
struct Branch {
    name: String,
    kind: BranchKind,
    from: usize,
    to: usize,
    phases: Vec<u8>,
    z: Complex64,
    taps: [f64; 3],
    normal_amps: f64,
    length_km: f64,
}

#[derive(Debug, Clone)]
struct Load {
    name: String,
    bus: usize,
    phases: Vec<u8>,
    kw: f64,
    kvar: f64,
}

#[derive(Debug, Clone)]
struct Capacitor {
    bus: usize,
    phases: Vec<u8>,
    kvar: f64,
}

#[derive(Debug, Clone)]
struct Der {
    spec: DerSpec,
    bus: usize,
    phases: Vec<u8>,
    /// Reactive output chosen by the control loop.
    kvar_out: f64,
}

impl Der {
    fn kva(&self) -> f64 {
        self.spec
            .kva
            .unwrap_or(self.spec.kw.abs() * DEFAULT_KVA_PER_KW)
    }

    fn kvar(&self) -> f64 {
        if self.spec.volt_var.is_some() {
            self.kvar_out
        } else {
            self.spec.kvar
        }
    }

    fn reactive_limit(&self) -> f64 {
        let kva = self.kva();
        (kva * kva - self.spec.kw * self.spec.kw).max(0.0).sqrt()
    }
}

#[derive(Debug, Clone)]
struct Circuit {
    name: String,
    source_pu: f64,
    source_z: Complex64,
    buses: Vec<Bus>,
    bus_index: HashMap<String, usize>,
    /// Breadth-first bus order, source first.
    order: Vec<usize>,
    branches: Vec<Branch>,
    loads: Vec<Load>,
    capacitors: Vec<Capacitor>,
    ders: Vec<Der>,
}

enum BranchDef<'a> {
    Line(&'a LineDef),
    Transformer(&'a TransformerDef),
}

impl BranchDef<'_> {
    fn name(&self) -> &str {
        match self {
            BranchDef::Line(l) => &l.name,
            BranchDef::Transformer(t) => &t.name,
        }
    }

    fn to(&self) -> &str {
        match self {
            BranchDef::Line(l) => &l.to,
            BranchDef::Transformer(t) => &t.to,
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn phase_base_amps(kv_ll: f64) -> f64 {
    PHASE_BASE_KVA / (kv_ll / 3f64.sqrt())
}

fn check_phases(phases: &[u8], available: &[u8], element: &str) -> Result<(), EngineError> {
    if phases.is_empty() {
        return Err(EngineError::InvalidValue(format!("{element} has no phases")));
    }
    for p in phases {
        if !available.contains(p) {
            return Err(EngineError::InvalidValue(format!(
                "{element} uses phase {p}, which is not present at its bus"
            )));
        }
    }
    Ok(())
}

impl Circuit {
    fn from_template(template: &FeederTemplate) -> Result<Self, EngineError> {
        let source_name = normalize(&template.source.bus);
        let source_z = {
            let z = (SYSTEM_BASE_KVA / 1000.0) / template.source.mvasc3.max(f64::EPSILON);
            let r = z / (1.0 + template.source.x_r_ratio.powi(2)).sqrt();
            Complex64::new(r, r * template.source.x_r_ratio)
        };

        let mut circuit = Circuit {
            name: template.name.clone(),
            source_pu: template.source.pu,
            source_z,
            buses: vec![Bus {
                name: source_name.clone(),
                kv_base: template.source.kv,
                phases: vec![1, 2, 3],
                feeder: None,
                children: Vec::new(),
                depth: 0,
            }],
            bus_index: HashMap::from([(source_name, 0)]),
            order: vec![0],
            branches: Vec::new(),
            loads: Vec::new(),
            capacitors: Vec::new(),
            ders: Vec::new(),
        };

        let mut by_from: HashMap<String, Vec<BranchDef>> = HashMap::new();
        for line in &template.lines {
            by_from.entry(normalize(&line.from)).or_default().push(BranchDef::Line(line));
        }
        for xf in &template.transformers {
            by_from.entry(normalize(&xf.from)).or_default().push(BranchDef::Transformer(xf));
        }
        let total_branches = template.lines.len() + template.transformers.len();

        let mut queue = VecDeque::from([0usize]);
        while let Some(from) = queue.pop_front() {
            let Some(defs) = by_from.remove(&circuit.buses[from].name) else {
                continue;
            };
            for def in defs {
                let to_name = normalize(def.to());
                if circuit.bus_index.contains_key(&to_name) {
                    return Err(EngineError::InvalidTemplate(format!(
                        "bus '{}' is fed by more than one branch (branch '{}')",
                        to_name,
                        def.name()
                    )));
                }
                let to = circuit.push_branch(from, to_name, &def, template)?;
                queue.push_back(to);
            }
        }

        if circuit.branches.len() != total_branches {
            let orphan = by_from
                .values()
                .flatten()
                .map(|d| d.name().to_string())
                .next()
                .unwrap_or_default();
            return Err(EngineError::InvalidTemplate(format!(
                "branch '{orphan}' is not connected to the source"
            )));
        }

        for load in &template.loads {
            circuit.add_load(load)?;
        }
        for cap in &template.capacitors {
            let bus = circuit.bus_id(&cap.bus)?;
            check_phases(&cap.phases, &circuit.buses[bus].phases, &cap.name)?;
            circuit.capacitors.push(Capacitor {
                bus,
                phases: cap.phases.clone(),
                kvar: cap.kvar,
            });
        }
        Ok(circuit)
    }

    fn push_branch(
        &mut self,
        from: usize,
        to_name: String,
        def: &BranchDef,
        template: &FeederTemplate,
    ) -> Result<usize, EngineError> {
        let from_bus = &self.buses[from];
        let (branch_kind, phases, z, taps, normal_amps, length_km, kv_to) = match def {
            BranchDef::Line(line) => {
                check_phases(&line.phases, &from_bus.phases, &line.name)?;
                let kv = from_bus.kv_base;
                if line.switch {
                    (
                        BranchKind::Switch,
                        line.phases.clone(),
                        Complex64::new(SWITCH_IMPEDANCE_PU, SWITCH_IMPEDANCE_PU),
                        [1.0; 3],
                        SWITCH_NORMAL_AMPS,
                        0.0,
                        kv,
                    )
                } else {
                    let code = line
                        .linecode
                        .as_ref()
                        .and_then(|c| template.linecodes.get(c))
                        .ok_or_else(|| {
                            EngineError::InvalidTemplate(format!("line '{}' has no linecode", line.name))
                        })?;
                    let length_km = template.length_units.to_km(line.length);
                    let per_km = Complex64::new(code.r1, code.x1) / code.units.to_km(1.0);
                    let z_base = kv * kv / (SYSTEM_BASE_KVA / 1000.0);
                    (
                        BranchKind::Line,
                        line.phases.clone(),
                        per_km * length_km / z_base,
                        [1.0; 3],
                        code.norm_amps,
                        length_km,
                        kv,
                    )
                }
            }
            BranchDef::Transformer(xf) => {
                if xf.kva <= 0.0 {
                    return Err(EngineError::InvalidTemplate(format!(
                        "transformer '{}' has non-positive rating",
                        xf.name
                    )));
                }
                let mut taps = [1.0; 3];
                if let Some(t) = &xf.taps {
                    for (slot, value) in taps.iter_mut().zip(t.iter()) {
                        *slot = *value;
                    }
                }
                let z = Complex64::new(xf.r_pct, xf.x_pct) / 100.0 * (SYSTEM_BASE_KVA / xf.kva);
                let kind = if xf.regulator {
                    BranchKind::Regulator
                } else {
                    BranchKind::Transformer
                };
                let amps = xf.kva / (3f64.sqrt() * xf.kv_low);
                (kind, from_bus.phases.clone(), z, taps, amps, 0.0, xf.kv_low)
            }
        };

        let to = self.buses.len();
        let branch_id = self.branches.len();
        let depth = self.buses[from].depth + 1;
        self.branches.push(Branch {
            name: normalize(def.name()),
            kind: branch_kind,
            from,
            to,
            phases: phases.clone(),
            z,
            taps,
            normal_amps,
            length_km,
        });
        self.buses.push(Bus {
            name: to_name.clone(),
            kv_base: kv_to,
            phases,
            feeder: Some(branch_id),
            children: Vec::new(),
            depth,
        });
        self.buses[from].children.push(branch_id);
        self.bus_index.insert(to_name, to);
        self.order.push(to);
        Ok(to)
    }

    fn bus_id(&self, name: &str) -> Result<usize, EngineError> {
        self.bus_index
            .get(&normalize(name))
            .copied()
            .ok_or_else(|| EngineError::UnknownBus(name.to_string()))
    }

    fn add_load(&mut self, spec: &LoadSpec) -> Result<(), EngineError> {
        let name = normalize(&spec.name);
        if self.loads.iter().any(|l| l.name == name) {
            return Err(EngineError::DuplicateElement(format!("load.{name}")));
        }
        let bus = self.bus_id(&spec.bus)?;
        let phases = if spec.phases.is_empty() {
            self.buses[bus].phases.clone()
        } else {
            spec.phases.clone()
        };
        check_phases(&phases, &self.buses[bus].phases, &format!("load.{name}"))?;
        self.loads.push(Load {
            name,
            bus,
            phases,
            kw: spec.kw,
            kvar: spec.kvar,
        });
        Ok(())
    }

    fn der_index(&self, name: &str) -> Result<usize, EngineError> {
        let key = normalize(name);
        self.ders
            .iter()
            .position(|d| d.spec.name == key)
            .ok_or_else(|| EngineError::UnknownElement(name.to_string()))
    }

    /// Per-phase constant-power demand (load minus generation) in per-unit.
    fn demand(&self, multiplier: f64) -> Vec<Phasors> {
        let mut demand = vec![ZERO; self.buses.len()];
        for load in &self.loads {
            let n = load.phases.len() as f64;
            let s = Complex64::new(load.kw, load.kvar) * multiplier / n / PHASE_BASE_KVA;
            for &p in &load.phases {
                demand[load.bus][usize::from(p - 1)] += s;
            }
        }
        for der in &self.ders {
            let n = der.phases.len() as f64;
            let s = Complex64::new(der.spec.kw, der.kvar()) / n / PHASE_BASE_KVA;
            for &p in &der.phases {
                demand[der.bus][usize::from(p - 1)] -= s;
            }
        }
        demand
    }

    /// Per-phase capacitor rating in per-unit at nominal voltage.
    fn shunt_q(&self) -> Vec<[f64; 3]> {
        let mut q = vec![[0.0; 3]; self.buses.len()];
        for cap in &self.capacitors {
            let n = cap.phases.len() as f64;
            for &p in &cap.phases {
                q[cap.bus][usize::from(p - 1)] += cap.kvar / n / PHASE_BASE_KVA;
            }
        }
        q
    }

    fn source_voltages(&self) -> Phasors {
        let mut v = ZERO;
        for (slot, angle) in v.iter_mut().zip(PHASE_ANGLES_DEG) {
            *slot = Complex64::from_polar(self.source_pu, angle.to_radians());
        }
        v
    }

    fn flat_start(&self) -> Vec<Phasors> {
        let source = self.source_voltages();
        self.buses
            .iter()
            .map(|bus| {
                let mut v = ZERO;
                for &p in &bus.phases {
                    let i = usize::from(p - 1);
                    v[i] = source[i];
                }
                v
            })
            .collect()
    }
}

struct SweepOutcome {
    converged: bool,
    iterations: u32,
    max_mismatch: f64,
    voltages: Vec<Phasors>,
    currents: Vec<Phasors>,
}

fn sweep(circuit: &Circuit, multiplier: f64, options: &SolveOptions) -> SweepOutcome {
    let demand = circuit.demand(multiplier);
    let shunt = circuit.shunt_q();
    let source = circuit.source_voltages();

    let mut voltages = circuit.flat_start();
    let mut currents = vec![ZERO; circuit.branches.len()];
    let mut max_mismatch = f64::INFINITY;

    for iteration in 1..=options.max_iterations {
        // Backward: accumulate injections toward the source.
        let mut totals = vec![ZERO; circuit.buses.len()];
        for (b, bus) in circuit.buses.iter().enumerate() {
            for &p in &bus.phases {
                let i = usize::from(p - 1);
                let v = voltages[b][i];
                let s = demand[b][i] - Complex64::new(0.0, shunt[b][i] * v.norm_sqr());
                totals[b][i] = (s / v).conj();
            }
        }
        for &b in circuit.order.iter().skip(1).rev() {
            let Some(branch_id) = circuit.buses[b].feeder else {
                continue;
            };
            let branch = &circuit.branches[branch_id];
            currents[branch_id] = totals[b];
            for &p in &branch.phases {
                let i = usize::from(p - 1);
                let through = totals[b][i] * branch.taps[i];
                totals[branch.from][i] += through;
            }
        }

        // Forward: update voltages from the source outward.
        let mut updated = vec![ZERO; circuit.buses.len()];
        for i in 0..3 {
            updated[0][i] = source[i] - circuit.source_z * totals[0][i];
        }
        for &b in circuit.order.iter().skip(1) {
            let Some(branch_id) = circuit.buses[b].feeder else {
                continue;
            };
            let branch = &circuit.branches[branch_id];
            for &p in &branch.phases {
                let i = usize::from(p - 1);
                updated[b][i] =
                    updated[branch.from][i] * branch.taps[i] - branch.z * currents[branch_id][i];
            }
        }

        max_mismatch = 0.0;
        let mut collapsed = false;
        for (b, bus) in circuit.buses.iter().enumerate() {
            for &p in &bus.phases {
                let i = usize::from(p - 1);
                let magnitude = updated[b][i].norm();
                if !magnitude.is_finite() || magnitude < COLLAPSE_VOLTAGE_PU {
                    collapsed = true;
                }
                max_mismatch = max_mismatch.max((updated[b][i] - voltages[b][i]).norm());
            }
        }
        voltages = updated;

        if collapsed {
            debug!(iteration, "voltage collapse during sweep");
            return SweepOutcome {
                converged: false,
                iterations: iteration,
                max_mismatch,
                voltages,
                currents,
            };
        }
        if max_mismatch < options.tolerance {
            return SweepOutcome {
                converged: true,
                iterations: iteration,
                max_mismatch,
                voltages,
                currents,
            };
        }
    }

    SweepOutcome {
        converged: false,
        iterations: options.max_iterations,
        max_mismatch,
        voltages,
        currents,
    }
}

#[derive(Debug, Clone)]
struct Solution {
    voltages: Vec<Phasors>,
    currents: Vec<Phasors>,
    converged: bool,
}

/// In-process radial power-flow engine.
#[derive(Debug, Clone)]
pub struct SweepEngine {
    circuit: Option<Circuit>,
    solution: Option<Solution>,
    load_multiplier: f64,
}

impl Default for SweepEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepEngine {
    pub fn new() -> Self {
        Self {
            circuit: None,
            solution: None,
            load_multiplier: 1.0,
        }
    }

    fn circuit(&self) -> Result<&Circuit, EngineError> {
        self.circuit.as_ref().ok_or(EngineError::NoActiveCircuit)
    }

    fn circuit_mut(&mut self) -> Result<&mut Circuit, EngineError> {
        self.solution = None;
        self.circuit.as_mut().ok_or(EngineError::NoActiveCircuit)
    }

    fn solved(&self) -> Result<(&Circuit, &Solution), EngineError> {
        let circuit = self.circuit()?;
        match &self.solution {
            Some(solution) if solution.converged => Ok((circuit, solution)),
            _ => Err(EngineError::NotSolved),
        }
    }

    /// Move every volt-var DER toward its curve. Returns true once settled.
    fn update_controls(circuit: &mut Circuit, voltages: &[Phasors]) -> bool {
        let mut settled = true;
        for der in circuit.ders.iter_mut() {
            let Some(curve) = &der.spec.volt_var else {
                continue;
            };
            let v_avg = der
                .phases
                .iter()
                .map(|&p| voltages[der.bus][usize::from(p - 1)].norm())
                .sum::<f64>()
                / der.phases.len() as f64;
            let limit = der.reactive_limit();
            let target = (curve.q_fraction(v_avg) * der.kva()).clamp(-limit, limit);
            let step = target - der.kvar_out;
            if step.abs() > CONTROL_TOLERANCE * der.kva().max(f64::EPSILON) {
                settled = false;
                der.kvar_out += CONTROL_DAMPING * step;
            }
        }
        settled
    }

    fn harmonic_order(
        circuit: &Circuit,
        solution: &Solution,
        multiplier: f64,
        order: u32,
    ) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        let mut voltages = BTreeMap::new();
        let mut currents = BTreeMap::new();
        let first = |phases: &[u8]| usize::from(phases.first().copied().unwrap_or(1) - 1);

        if order == 1 {
            for (b, bus) in circuit.buses.iter().enumerate() {
                voltages.insert(bus.name.clone(), solution.voltages[b][first(&bus.phases)].norm());
            }
            for (id, branch) in circuit.branches.iter().enumerate() {
                if matches!(branch.kind, BranchKind::Line | BranchKind::Switch) {
                    currents.insert(branch.name.clone(), solution.currents[id][first(&branch.phases)].norm());
                }
            }
            return (voltages, currents);
        }

        // Harmonic current sources, taken in phase with each other.
        let mut injections = vec![[0.0f64; 3]; circuit.buses.len()];
        for load in &circuit.loads {
            let n = load.phases.len() as f64;
            let s = Complex64::new(load.kw, load.kvar).norm() * multiplier / n / PHASE_BASE_KVA;
            let h = spectrum_magnitude(LOAD_SPECTRUM, order);
            for &p in &load.phases {
                let i = usize::from(p - 1);
                let v = solution.voltages[load.bus][i].norm().max(COLLAPSE_VOLTAGE_PU);
                injections[load.bus][i] += s / v * h;
            }
        }
        for der in &circuit.ders {
            let n = der.phases.len() as f64;
            let s = Complex64::new(der.spec.kw, der.kvar()).norm() / n / PHASE_BASE_KVA;
            let h = spectrum_magnitude(INVERTER_SPECTRUM, order);
            for &p in &der.phases {
                let i = usize::from(p - 1);
                let v = solution.voltages[der.bus][i].norm().max(COLLAPSE_VOLTAGE_PU);
                injections[der.bus][i] += s / v * h;
            }
        }

        let mut branch_currents = vec![[0.0f64; 3]; circuit.branches.len()];
        let mut totals = injections;
        for &b in circuit.order.iter().skip(1).rev() {
            let Some(branch_id) = circuit.buses[b].feeder else {
                continue;
            };
            let branch = &circuit.branches[branch_id];
            branch_currents[branch_id] = totals[b];
            for &p in &branch.phases {
                let i = usize::from(p - 1);
                let through = totals[b][i] * branch.taps[i];
                totals[branch.from][i] += through;
            }
        }

        let h = f64::from(order);
        let scale = |z: Complex64| Complex64::new(z.re, z.im * h);
        let mut vh = vec![ZERO; circuit.buses.len()];
        for i in 0..3 {
            vh[0][i] = scale(circuit.source_z) * totals[0][i];
        }
        for &b in circuit.order.iter().skip(1) {
            let Some(branch_id) = circuit.buses[b].feeder else {
                continue;
            };
            let branch = &circuit.branches[branch_id];
            for &p in &branch.phases {
                let i = usize::from(p - 1);
                vh[b][i] = vh[branch.from][i] * branch.taps[i]
                    + scale(branch.z) * branch_currents[branch_id][i];
            }
        }

        for (b, bus) in circuit.buses.iter().enumerate() {
            voltages.insert(bus.name.clone(), vh[b][first(&bus.phases)].norm());
        }
        for (id, branch) in circuit.branches.iter().enumerate() {
            if matches!(branch.kind, BranchKind::Line | BranchKind::Switch) {
                currents.insert(branch.name.clone(), branch_currents[id][first(&branch.phases)]);
            }
        }
        (voltages, currents)
    }
}

impl CircuitEngine for SweepEngine {
    fn clear(&mut self) {
        self.circuit = None;
        self.solution = None;
        self.load_multiplier = 1.0;
    }

    fn compile(&mut self, template: &FeederTemplate) -> Result<(), EngineError> {
        let circuit = Circuit::from_template(template)?;
        debug!(
            circuit = %circuit.name,
            buses = circuit.buses.len(),
            branches = circuit.branches.len(),
            "circuit compiled"
        );
        self.circuit = Some(circuit);
        self.solution = None;
        self.load_multiplier = 1.0;
        Ok(())
    }

    fn circuit_name(&self) -> Option<String> {
        self.circuit.as_ref().map(|c| c.name.clone())
    }

    fn summary(&self) -> Result<CircuitSummary, EngineError> {
        let c = self.circuit()?;
        let mut bases: Vec<f64> = c.buses.iter().map(|b| b.kv_base).collect();
        bases.sort_by(|a, b| b.total_cmp(a));
        bases.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

        let count = |kinds: &[BranchKind]| c.branches.iter().filter(|b| kinds.contains(&b.kind)).count();

        Ok(CircuitSummary {
            name: c.name.clone(),
            num_buses: c.buses.len(),
            num_lines: count(&[BranchKind::Line, BranchKind::Switch]),
            num_transformers: count(&[BranchKind::Transformer, BranchKind::Regulator]),
            num_loads: c.loads.len(),
            num_ders: c.ders.len(),
            total_load_kw: c.loads.iter().map(|l| l.kw).sum::<f64>() * self.load_multiplier,
            total_load_kvar: c.loads.iter().map(|l| l.kvar).sum::<f64>() * self.load_multiplier,
            voltage_bases_kv: bases,
            feeder_length_km: c.branches.iter().map(|b| b.length_km).sum(),
            source_bus: c.buses[0].name.clone(),
        })
    }

    fn set_source_pu(&mut self, pu: f64) -> Result<(), EngineError> {
        if !(pu.is_finite() && pu > 0.0) {
            return Err(EngineError::InvalidValue(format!("source voltage {pu} pu")));
        }
        self.circuit_mut()?.source_pu = pu;
        Ok(())
    }

    fn set_load_multiplier(&mut self, multiplier: f64) -> Result<(), EngineError> {
        if !(multiplier.is_finite() && multiplier >= 0.0) {
            return Err(EngineError::InvalidValue(format!("load multiplier {multiplier}")));
        }
        self.circuit_mut()?;
        self.load_multiplier = multiplier;
        Ok(())
    }

    fn load_multiplier(&self) -> f64 {
        self.load_multiplier
    }

    fn add_load(&mut self, load: &LoadSpec) -> Result<(), EngineError> {
        self.circuit_mut()?.add_load(load)
    }

    fn add_der(&mut self, der: &DerSpec) -> Result<(), EngineError> {
        let circuit = self.circuit_mut()?;
        let name = normalize(&der.name);
        if circuit.ders.iter().any(|d| d.spec.name == name) {
            return Err(EngineError::DuplicateElement(name));
        }
        if !der.kw.is_finite() {
            return Err(EngineError::InvalidValue(format!("DER output {} kW", der.kw)));
        }
        let bus = circuit.bus_id(&der.bus)?;
        let mut spec = der.clone();
        spec.name = name;
        spec.bus = circuit.buses[bus].name.clone();
        circuit.ders.push(Der {
            spec,
            bus,
            phases: circuit.buses[bus].phases.clone(),
            kvar_out: 0.0,
        });
        Ok(())
    }

    fn set_der_kw(&mut self, name: &str, kw: f64) -> Result<(), EngineError> {
        if !kw.is_finite() {
            return Err(EngineError::InvalidValue(format!("DER output {kw} kW")));
        }
        let circuit = self.circuit_mut()?;
        let idx = circuit.der_index(name)?;
        let der = &mut circuit.ders[idx];
        // inverter rating is fixed; it only grows if active power exceeds it
        der.spec.kw = kw;
        if let Some(kva) = der.spec.kva {
            der.spec.kva = Some(kva.max(kw.abs()));
        }
        der.kvar_out = 0.0;
        Ok(())
    }

    fn remove_der(&mut self, name: &str) -> Result<(), EngineError> {
        let circuit = self.circuit_mut()?;
        let idx = circuit.der_index(name)?;
        circuit.ders.remove(idx);
        Ok(())
    }

    fn der_output(&self, name: &str) -> Result<DerOutput, EngineError> {
        let circuit = self.circuit()?;
        let der = &circuit.ders[circuit.der_index(name)?];
        Ok(DerOutput {
            kw: der.spec.kw,
            kvar: der.kvar(),
            kva: der.kva(),
        })
    }

    fn solve(&mut self, options: &SolveOptions) -> Result<SolveReport, EngineError> {
        if options.max_iterations == 0 || !(options.tolerance > 0.0) {
            return Err(EngineError::InvalidValue(
                "max_iterations and tolerance must be positive".to_string(),
            ));
        }
        let multiplier = self.load_multiplier;
        let circuit = self.circuit.as_mut().ok_or(EngineError::NoActiveCircuit)?;
        if options.mode != SolutionMode::Snapshot {
            debug!(mode = %options.mode, "no load shapes defined; solving a single snapshot");
        }
        for der in circuit.ders.iter_mut() {
            der.kvar_out = 0.0;
        }
        let has_controls = circuit.ders.iter().any(|d| d.spec.volt_var.is_some());

        let mut iterations = 0;
        let mut control_iterations = 0;
        let mut outcome;
        loop {
            outcome = sweep(circuit, multiplier, options);
            iterations += outcome.iterations;
            control_iterations += 1;
            if !outcome.converged || !has_controls {
                break;
            }
            if Self::update_controls(circuit, &outcome.voltages) {
                break;
            }
            if control_iterations >= MAX_CONTROL_PASSES {
                warn!(
                    passes = control_iterations,
                    "volt-var control did not settle; keeping last solution"
                );
                break;
            }
        }

        let report = SolveReport {
            converged: outcome.converged,
            iterations,
            control_iterations,
            max_mismatch: outcome.max_mismatch,
        };
        self.solution = Some(Solution {
            voltages: outcome.voltages,
            currents: outcome.currents,
            converged: outcome.converged,
        });
        Ok(report)
    }

    fn is_solved(&self) -> bool {
        matches!(&self.solution, Some(s) if s.converged)
    }

    fn bus_voltages(&self) -> Result<Vec<BusVoltage>, EngineError> {
        let (circuit, solution) = self.solved()?;
        let mut out = Vec::new();
        for &b in &circuit.order {
            let bus = &circuit.buses[b];
            for &p in &bus.phases {
                let v = solution.voltages[b][usize::from(p - 1)];
                out.push(BusVoltage {
                    bus: bus.name.clone(),
                    phase: p,
                    magnitude_pu: v.norm(),
                    angle_deg: v.arg().to_degrees(),
                    kv_base: bus.kv_base,
                });
            }
        }
        Ok(out)
    }

    fn line_flows(&self) -> Result<Vec<LineFlow>, EngineError> {
        let (circuit, solution) = self.solved()?;
        Ok(circuit
            .branches
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b.kind, BranchKind::Line | BranchKind::Switch))
            .map(|(id, branch)| {
                let base = phase_base_amps(circuit.buses[branch.to].kv_base);
                let amps = branch
                    .phases
                    .iter()
                    .map(|&p| solution.currents[id][usize::from(p - 1)].norm() * base)
                    .fold(0.0, f64::max);
                LineFlow {
                    name: branch.name.clone(),
                    from_bus: circuit.buses[branch.from].name.clone(),
                    to_bus: circuit.buses[branch.to].name.clone(),
                    current_amps: amps,
                    normal_amps: branch.normal_amps,
                    loading_pct: if branch.normal_amps > 0.0 {
                        amps / branch.normal_amps * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect())
    }

    fn losses(&self) -> Result<PowerTotals, EngineError> {
        let (circuit, solution) = self.solved()?;
        let mut totals = PowerTotals::default();
        for (id, branch) in circuit.branches.iter().enumerate() {
            for &p in &branch.phases {
                let i2 = solution.currents[id][usize::from(p - 1)].norm_sqr();
                totals.kw += i2 * branch.z.re * PHASE_BASE_KVA;
                totals.kvar += i2 * branch.z.im * PHASE_BASE_KVA;
            }
        }
        Ok(totals)
    }

    fn solve_harmonics(&mut self, orders: &[u32]) -> Result<HarmonicSolution, EngineError> {
        let multiplier = self.load_multiplier;
        let (circuit, solution) = self.solved()?;
        let mut result = HarmonicSolution::default();
        for &order in orders {
            if order == 0 {
                return Err(EngineError::InvalidValue("harmonic order 0".to_string()));
            }
            let (v, i) = Self::harmonic_order(circuit, solution, multiplier, order);
            result.voltages.insert(order, v);
            result.currents.insert(order, i);
        }
        Ok(result)
    }

    fn topology(&self) -> Result<Topology, EngineError> {
        let c = self.circuit()?;
        let mut loaded = vec![false; c.buses.len()];
        for load in &c.loads {
            loaded[load.bus] = true;
        }
        Ok(Topology {
            source_bus: c.buses[0].name.clone(),
            buses: c
                .order
                .iter()
                .map(|&b| TopologyBus {
                    name: c.buses[b].name.clone(),
                    kv_base: c.buses[b].kv_base,
                    phases: c.buses[b].phases.clone(),
                    depth: c.buses[b].depth,
                    has_load: loaded[b],
                })
                .collect(),
            edges: c
                .branches
                .iter()
                .map(|b| TopologyEdge {
                    name: b.name.clone(),
                    from: c.buses[b.from].name.clone(),
                    to: c.buses[b.to].name.clone(),
                    kind: b.kind,
                    length_km: b.length_km,
                })
                .collect(),
        })
    }
}
