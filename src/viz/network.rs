//! Feeder one-line diagrams: bus placement and drawing.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use super::chart::{PALETTE, VIOLATION_COLOR};
use super::svg::{Anchor, Rect, Stroke, SvgDocument, TextStyle};
use crate::engine::{BranchKind, Topology};

const SPRING_ITERATIONS: usize = 50;
const OVERVOLTAGE_COLOR: &str = "#ff7f0e";
const NORMAL_COLOR: &str = "#2ca02c";
const HIGHLIGHT_COLOR: &str = "#000000";
/// Label every bus only up to this size.
const MAX_LABELLED_BUSES: usize = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Layout {
    #[default]
    Tree,
    Radial,
    Spring,
}

/// Normalized bus positions, both coordinates in [0, 1].
pub type Positions = BTreeMap<String, (f64, f64)>;

pub fn layout(topology: &Topology, kind: Layout) -> Positions {
    match kind {
        Layout::Tree => tree_layout(topology),
        Layout::Radial => radial_layout(topology),
        Layout::Spring => spring_layout(topology, SPRING_ITERATIONS),
    }
}

fn children(topology: &Topology) -> HashMap<&str, Vec<&str>> {
    let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &topology.edges {
        map.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }
    map
}

/// Leaf slot of every bus (leaves numbered left to right) and the leaf count.
fn leaf_slots(topology: &Topology) -> (HashMap<String, f64>, usize) {
    let kids = children(topology);
    let mut slots = HashMap::new();
    let mut next_leaf = 0usize;

    // iterative post-order from the source
    let mut stack: Vec<(&str, bool)> = vec![(topology.source_bus.as_str(), false)];
    while let Some((bus, expanded)) = stack.pop() {
        let below = kids.get(bus).map(Vec::as_slice).unwrap_or(&[]);
        if below.is_empty() {
            slots.insert(bus.to_string(), next_leaf as f64);
            next_leaf += 1;
        } else if expanded {
            let mean = below.iter().filter_map(|c| slots.get(*c)).sum::<f64>() / below.len() as f64;
            slots.insert(bus.to_string(), mean);
        } else {
            stack.push((bus, true));
            for child in below.iter().rev() {
                stack.push((*child, false));
            }
        }
    }
    (slots, next_leaf.max(1))
}

/// Depth grows downward; leaves are spaced evenly and parents sit over the
/// mean of their children.
pub fn tree_layout(topology: &Topology) -> Positions {
    let (slots, leaves) = leaf_slots(topology);
    let max_depth = topology.buses.iter().map(|b| b.depth).max().unwrap_or(0).max(1);
    topology
        .buses
        .iter()
        .map(|b| {
            let slot = slots.get(&b.name).copied().unwrap_or(0.0);
            let x = if leaves > 1 { slot / (leaves - 1) as f64 } else { 0.5 };
            let y = b.depth as f64 / max_depth as f64;
            (b.name.clone(), (x, y))
        })
        .collect()
}

/// Source at the centre, depth as radius, leaf slot as angle.
pub fn radial_layout(topology: &Topology) -> Positions {
    let (slots, leaves) = leaf_slots(topology);
    let max_depth = topology.buses.iter().map(|b| b.depth).max().unwrap_or(0).max(1);
    topology
        .buses
        .iter()
        .map(|b| {
            let slot = slots.get(&b.name).copied().unwrap_or(0.0);
            let angle = std::f64::consts::TAU * slot / leaves as f64;
            let r = 0.5 * b.depth as f64 / max_depth as f64;
            (b.name.clone(), (0.5 + r * angle.cos(), 0.5 + r * angle.sin()))
        })
        .collect()
}

/// Force-directed placement (Fruchterman-Reingold) seeded from the tree layout
/// so the result is deterministic.
pub fn spring_layout(topology: &Topology, iterations: usize) -> Positions {
    let seed = tree_layout(topology);
    let names: Vec<&String> = seed.keys().collect();
    let n = names.len();
    if n < 2 {
        return seed;
    }
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
    let mut pos: Vec<(f64, f64)> = names.iter().map(|s| seed[*s]).collect();
    let edges: Vec<(usize, usize)> = topology
        .edges
        .iter()
        .filter_map(|e| Some((*index.get(e.from.as_str())?, *index.get(e.to.as_str())?)))
        .collect();

    let k = (1.0 / n as f64).sqrt();
    let mut temperature = 0.1;
    let cooling = temperature / (iterations as f64 + 1.0);
    for _ in 0..iterations {
        let mut disp = vec![(0.0f64, 0.0f64); n];
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = pos[i].0 - pos[j].0;
                let dy = pos[i].1 - pos[j].1;
                let d = (dx * dx + dy * dy).sqrt().max(1e-4);
                let f = k * k / d;
                disp[i].0 += dx / d * f;
                disp[i].1 += dy / d * f;
                disp[j].0 -= dx / d * f;
                disp[j].1 -= dy / d * f;
            }
        }
        for &(a, b) in &edges {
            let dx = pos[a].0 - pos[b].0;
            let dy = pos[a].1 - pos[b].1;
            let d = (dx * dx + dy * dy).sqrt().max(1e-4);
            let f = d * d / k;
            disp[a].0 -= dx / d * f;
            disp[a].1 -= dy / d * f;
            disp[b].0 += dx / d * f;
            disp[b].1 += dy / d * f;
        }
        for (p, d) in pos.iter_mut().zip(&disp) {
            let len = (d.0 * d.0 + d.1 * d.1).sqrt().max(1e-9);
            let step = len.min(temperature);
            p.0 += d.0 / len * step;
            p.1 += d.1 / len * step;
        }
        temperature -= cooling;
    }

    normalize(names.iter().map(|s| (*s).clone()).zip(pos).collect())
}

fn normalize(mut positions: Positions) -> Positions {
    let (mut x0, mut x1, mut y0, mut y1) = (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
    for &(x, y) in positions.values() {
        x0 = x0.min(x);
        x1 = x1.max(x);
        y0 = y0.min(y);
        y1 = y1.max(y);
    }
    let sx = if x1 - x0 > 1e-12 { x1 - x0 } else { 1.0 };
    let sy = if y1 - y0 > 1e-12 { y1 - y0 } else { 1.0 };
    for p in positions.values_mut() {
        *p = ((p.0 - x0) / sx, (p.1 - y0) / sy);
    }
    positions
}

/// What to draw on top of the bare topology.
#[derive(Debug, Clone, Default)]
pub struct DiagramStyle {
    pub title: String,
    /// Per-unit voltage per bus; buses without one keep the neutral color.
    pub voltages: HashMap<String, f64>,
    pub limits: Option<(f64, f64)>,
    /// Buses drawn with a heavy outline.
    pub highlight: HashSet<String>,
}

pub fn bus_color(voltage: Option<f64>, limits: Option<(f64, f64)>) -> &'static str {
    match (voltage, limits) {
        (Some(v), Some((lo, _))) if v < lo => VIOLATION_COLOR,
        (Some(v), Some((_, hi))) if v > hi => OVERVOLTAGE_COLOR,
        (Some(_), _) => NORMAL_COLOR,
        (None, _) => PALETTE[0],
    }
}

/// Draw the diagram into `area`. Returns the number of buses drawn.
pub fn draw(doc: &mut SvgDocument, area: Rect, topology: &Topology, positions: &Positions, style: &DiagramStyle) -> usize {
    let font = (area.h / 45.0).clamp(7.0, 13.0);
    let mut frame = area;
    if !style.title.is_empty() {
        doc.text(
            area.x + area.w / 2.0,
            area.y + font * 1.8,
            &style.title,
            &TextStyle::new(font * 1.4).anchor(Anchor::Middle).bold(),
        );
        frame = frame.inset(0.0, font * 3.0, 0.0, 0.0);
    }
    let plot = frame.inset(font * 3.0, font * 2.0, font * 3.0, font * 2.0);
    let to_px = |p: (f64, f64)| (plot.x + p.0 * plot.w, plot.y + p.1 * plot.h);

    for edge in &topology.edges {
        let (Some(&a), Some(&b)) = (positions.get(&edge.from), positions.get(&edge.to)) else {
            continue;
        };
        let (x1, y1) = to_px(a);
        let (x2, y2) = to_px(b);
        match edge.kind {
            BranchKind::Line => doc.line(x1, y1, x2, y2, &Stroke::solid("#777777", 1.4)),
            BranchKind::Switch => doc.line(x1, y1, x2, y2, &Stroke::dashed("#777777", 1.4)),
            BranchKind::Transformer | BranchKind::Regulator => {
                doc.line(x1, y1, x2, y2, &Stroke::solid("#333333", 2.4));
                let s = font * 0.7;
                doc.rect(
                    Rect::new((x1 + x2) / 2.0 - s / 2.0, (y1 + y2) / 2.0 - s / 2.0, s, s),
                    "#ffffff",
                    Some(&Stroke::solid("#333333", 1.2)),
                );
            }
        }
    }

    let labelled = topology.buses.len() <= MAX_LABELLED_BUSES;
    let radius = (font * 0.55).max(3.0);
    let mut drawn = 0;
    for bus in &topology.buses {
        let Some(&p) = positions.get(&bus.name) else {
            continue;
        };
        let (x, y) = to_px(p);
        let color = bus_color(style.voltages.get(&bus.name).copied(), style.limits);
        let outline = style
            .highlight
            .contains(&bus.name)
            .then(|| Stroke::solid(HIGHLIGHT_COLOR, 2.5));
        let r = if bus.name == topology.source_bus { radius * 1.6 } else { radius };
        doc.circle(x, y, r, color, outline.as_ref());
        if labelled || style.highlight.contains(&bus.name) {
            doc.text(x + r + 2.0, y - r, &bus.name, &TextStyle::new(font * 0.8));
        }
        drawn += 1;
    }

    if style.limits.is_some() && !style.voltages.is_empty() {
        let entries = [
            (NORMAL_COLOR, "within limits"),
            (VIOLATION_COLOR, "undervoltage"),
            (OVERVOLTAGE_COLOR, "overvoltage"),
        ];
        for (i, (color, label)) in entries.iter().enumerate() {
            let y = frame.y + font * (1.2 + 1.3 * i as f64);
            doc.circle(frame.x + font, y - font * 0.3, font * 0.4, color, None);
            doc.text(frame.x + font * 2.0, y, label, &TextStyle::new(font * 0.8));
        }
    }
    drawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CircuitEngine, FeederCatalog, SweepEngine};

    fn ieee13_topology() -> Topology {
        let mut engine = SweepEngine::new();
        let template = FeederCatalog::get("IEEE13").unwrap();
        engine.compile(&template).unwrap();
        engine.topology().unwrap()
    }

    fn in_unit_square(p: &Positions) -> bool {
        p.values().all(|&(x, y)| (-1e-9..=1.0 + 1e-9).contains(&x) && (-1e-9..=1.0 + 1e-9).contains(&y))
    }

    #[test]
    fn test_tree_layout_places_source_on_top() {
        let topo = ieee13_topology();
        let pos = tree_layout(&topo);
        assert_eq!(pos.len(), topo.buses.len());
        assert_eq!(pos[&topo.source_bus].1, 0.0);
        assert!(in_unit_square(&pos));
        // every child sits below its parent
        for e in &topo.edges {
            assert!(pos[&e.to].1 > pos[&e.from].1, "{} -> {}", e.from, e.to);
        }
    }

    #[test]
    fn test_parent_centered_over_children() {
        let topo = ieee13_topology();
        let pos = tree_layout(&topo);
        let kids = children(&topo);
        for (parent, below) in kids {
            let mean = below.iter().map(|c| pos[*c].0).sum::<f64>() / below.len() as f64;
            assert!((pos[parent].0 - mean).abs() < 1e-9, "{parent}");
        }
    }

    #[test]
    fn test_radial_and_spring_are_bounded() {
        let topo = ieee13_topology();
        let radial = radial_layout(&topo);
        assert!(in_unit_square(&radial));
        assert_eq!(radial[&topo.source_bus], (0.5, 0.5));

        let spring = spring_layout(&topo, 50);
        assert_eq!(spring.len(), topo.buses.len());
        assert!(in_unit_square(&spring));
        // deterministic
        assert_eq!(spring, spring_layout(&topo, 50));
    }

    #[test]
    fn test_bus_colors() {
        let limits = Some((0.95, 1.05));
        assert_eq!(bus_color(Some(0.93), limits), VIOLATION_COLOR);
        assert_eq!(bus_color(Some(1.06), limits), OVERVOLTAGE_COLOR);
        assert_eq!(bus_color(Some(1.0), limits), NORMAL_COLOR);
        assert_eq!(bus_color(None, limits), PALETTE[0]);
    }

    #[test]
    fn test_draw_counts_buses() {
        let topo = ieee13_topology();
        let pos = layout(&topo, Layout::Tree);
        let mut doc = SvgDocument::new(800, 600);
        let style = DiagramStyle {
            title: "IEEE13".into(),
            highlight: ["675".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let area = doc.bounds();
        assert_eq!(draw(&mut doc, area, &topo, &pos, &style), 16);
        let svg = doc.finish();
        assert!(svg.contains(">675<"));
    }

    #[test]
    fn test_layout_parse() {
        assert_eq!("Spring".parse::<Layout>().unwrap(), Layout::Spring);
        assert!("hierarchical".parse::<Layout>().is_err());
    }
}
