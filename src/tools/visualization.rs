use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString, IntoStaticStr};
use tracing::{debug, info};
use validator::Validate;

use super::{require_solved, Metadata, ToolError, ToolOutput};
use crate::engine::BusVoltage;
use crate::session::Session;
use crate::viz::chart::{PALETTE, VIOLATION_COLOR};
use crate::viz::network::{self, DiagramStyle, Layout};
use crate::viz::{render_stacked, Chart, Series, SeriesKind, SvgDocument};

/// Voltage THD planning limit, percent.
const THD_LIMIT_PCT: f64 = 5.0;
const MAX_FIGURE_INCHES: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlotType {
    VoltageProfile,
    NetworkDiagram,
    Timeseries,
    CapacityCurve,
    HarmonicsSpectrum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataSource {
    Circuit,
    LastPowerFlow,
    LastCapacity,
    LastTimeseries,
    LastHarmonics,
    LastVoltageCheck,
}

impl PlotType {
    /// Source used when the caller names none.
    pub fn default_source(self) -> DataSource {
        match self {
            PlotType::VoltageProfile | PlotType::NetworkDiagram => DataSource::Circuit,
            PlotType::Timeseries => DataSource::LastTimeseries,
            PlotType::CapacityCurve => DataSource::LastCapacity,
            PlotType::HarmonicsSpectrum => DataSource::LastHarmonics,
        }
    }

    fn accepts(self, source: DataSource) -> bool {
        use DataSource::*;
        match self {
            PlotType::VoltageProfile | PlotType::NetworkDiagram => {
                matches!(source, Circuit | LastPowerFlow | LastVoltageCheck)
            }
            PlotType::Timeseries => source == LastTimeseries,
            PlotType::CapacityCurve => source == LastCapacity,
            PlotType::HarmonicsSpectrum => matches!(source, LastHarmonics | LastPowerFlow),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TimeseriesVariable {
    TotalLoadKw,
    LossesKw,
    MinVoltagePu,
    MaxVoltagePu,
    LoadMultiplier,
}

impl TimeseriesVariable {
    const DEFAULT: [TimeseriesVariable; 3] = [Self::TotalLoadKw, Self::LossesKw, Self::MinVoltagePu];

    fn label(self) -> &'static str {
        match self {
            Self::TotalLoadKw => "Load (kW)",
            Self::LossesKw => "Losses (kW)",
            Self::MinVoltagePu => "Min voltage (pu)",
            Self::MaxVoltagePu => "Max voltage (pu)",
            Self::LoadMultiplier => "Load multiplier",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct PlotOptions {
    pub title: Option<String>,
    #[validate(length(equal = 2))]
    pub figsize: Option<Vec<f64>>,
    #[validate(range(min = 10, max = 600))]
    pub dpi: Option<u32>,
    pub save_path: Option<String>,
    pub show_violations: Option<bool>,
    pub show_grid: Option<bool>,
    pub variables: Option<Vec<String>>,
    pub xlabel: Option<String>,
    pub ylabel: Option<String>,
    pub layout: Option<String>,
    #[validate(range(min = 0.5, max = 1.5))]
    pub min_voltage_pu: Option<f64>,
    #[validate(range(min = 0.5, max = 1.5))]
    pub max_voltage_pu: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct VisualizationArgs {
    pub plot_type: String,
    pub data_source: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub options: PlotOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisualizationResult {
    pub plot_type: PlotType,
    pub format: &'static str,
    pub dimensions: Dimensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_svg: Option<String>,
    pub data_source: DataSource,
    /// Buses, points or bars drawn.
    pub elements_plotted: usize,
}

/// Resolved rendering settings.
struct Figure {
    width: u32,
    height: u32,
    title: Option<String>,
    show_violations: bool,
    grid: bool,
    limits: (f64, f64),
}

pub fn generate_visualization(
    session: &mut Session,
    args: VisualizationArgs,
) -> Result<ToolOutput<VisualizationResult>, ToolError> {
    let plot_type: PlotType = args.plot_type.parse().map_err(|_| {
        ToolError::InvalidInput(format!(
            "Unknown plot type '{}'. Expected one of: voltage_profile, network_diagram, timeseries, \
             capacity_curve, harmonics_spectrum",
            args.plot_type
        ))
    })?;
    let source = match args.data_source.as_deref() {
        None => plot_type.default_source(),
        Some(name) => name.parse::<DataSource>().map_err(|_| {
            ToolError::InvalidInput(format!(
                "Unknown data source '{name}'. Expected one of: circuit, last_power_flow, last_capacity, \
                 last_timeseries, last_harmonics, last_voltage_check"
            ))
        })?,
    };
    if !plot_type.accepts(source) {
        return Err(ToolError::InvalidInput(format!(
            "data source '{source}' cannot be used for a {plot_type} plot"
        )));
    }

    let opts = &args.options;
    let viz = &session.config.visualization;
    let figsize = match &opts.figsize {
        Some(size) => [size[0], size[1]],
        None => viz.default_figsize,
    };
    if figsize.iter().any(|v| !v.is_finite() || *v <= 0.0 || *v > MAX_FIGURE_INCHES) {
        return Err(ToolError::InvalidInput(format!(
            "figsize values must be in (0, {MAX_FIGURE_INCHES}] inches"
        )));
    }
    let dpi = opts.dpi.unwrap_or(viz.default_dpi);
    let limits = (
        opts.min_voltage_pu.unwrap_or(session.config.analysis.min_voltage_pu),
        opts.max_voltage_pu.unwrap_or(session.config.analysis.max_voltage_pu),
    );
    if limits.0 >= limits.1 {
        return Err(ToolError::InvalidInput(format!(
            "min_voltage_pu ({}) must be less than max_voltage_pu ({})",
            limits.0, limits.1
        )));
    }
    let figure = Figure {
        width: (figsize[0] * f64::from(dpi)).round() as u32,
        height: (figsize[1] * f64::from(dpi)).round() as u32,
        title: opts.title.clone(),
        show_violations: opts.show_violations.unwrap_or(true),
        grid: opts.show_grid.unwrap_or(true),
        limits,
    };

    let (doc, elements) = match plot_type {
        PlotType::VoltageProfile => voltage_profile(session, source, &figure, opts)?,
        PlotType::NetworkDiagram => network_diagram(session, source, &figure, opts)?,
        PlotType::Timeseries => timeseries(session, &figure, opts)?,
        PlotType::CapacityCurve => capacity_curve(session, &figure, opts)?,
        PlotType::HarmonicsSpectrum => harmonics_spectrum(session, source, &figure)?,
    };
    let svg = doc.finish();

    let file_path = match &opts.save_path {
        Some(path) => Some(write_svg(&viz.output_dir, path, &svg)?),
        None => None,
    };
    info!(
        plot = %plot_type,
        source = %source,
        width = figure.width,
        height = figure.height,
        elements,
        saved = file_path.is_some(),
        "visualization rendered"
    );

    let result = VisualizationResult {
        plot_type,
        format: "svg",
        dimensions: Dimensions {
            width: figure.width,
            height: figure.height,
        },
        image_svg: file_path.is_none().then_some(svg),
        file_path: file_path.map(|p| p.display().to_string()),
        data_source: source,
        elements_plotted: elements,
    };
    let metadata = Metadata::new("visualization", session.engine.circuit_name())
        .with("figsize", json!(figsize))
        .with("dpi", dpi)
        .with("title", figure.title.clone())
        .with("data_source", source.to_string());
    Ok(ToolOutput::new(result, metadata))
}

/// Write the document, resolving relative paths against `output_dir`.
fn write_svg(output_dir: &Path, save_path: &str, svg: &str) -> Result<PathBuf, ToolError> {
    let requested = PathBuf::from(save_path);
    let path = if requested.is_absolute() {
        requested
    } else {
        output_dir.join(requested)
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, svg)?;
    debug!(path = %path.display(), bytes = svg.len(), "svg written");
    Ok(path)
}

fn missing(what: &str, tool: &str) -> ToolError {
    ToolError::MissingData(format!("No {what} results available. Run {tool} first"))
}

/// Bus voltages from the chosen source, all phases where the source has them.
fn source_voltages(session: &Session, source: DataSource) -> Result<Vec<BusVoltage>, ToolError> {
    match source {
        DataSource::Circuit => {
            require_solved(session)?;
            Ok(session.engine.bus_voltages()?)
        }
        DataSource::LastPowerFlow => {
            let pf = session
                .results
                .power_flow
                .as_ref()
                .ok_or_else(|| missing("power flow", "run_power_flow"))?;
            Ok(pf
                .bus_voltages
                .iter()
                .map(|(bus, v)| BusVoltage {
                    bus: bus.clone(),
                    phase: 1,
                    magnitude_pu: *v,
                    angle_deg: 0.0,
                    kv_base: 0.0,
                })
                .collect())
        }
        DataSource::LastVoltageCheck => session
            .results
            .voltage_check
            .as_ref()
            .map(|check| check.checked.clone())
            .ok_or_else(|| missing("voltage check", "check_voltages")),
        _ => Err(ToolError::InvalidInput(format!("data source '{source}' has no bus voltages"))),
    }
}

fn voltage_profile(
    session: &Session,
    source: DataSource,
    figure: &Figure,
    opts: &PlotOptions,
) -> Result<(SvgDocument, usize), ToolError> {
    let voltages = source_voltages(session, source)?;
    if voltages.is_empty() {
        return Err(ToolError::MissingData("no bus voltages to plot".to_string()));
    }
    let (lo, hi) = figure.limits;

    let buses: Vec<String> = voltages.iter().map(|v| v.bus.clone()).unique().collect();
    let slot: HashMap<String, usize> = buses.iter().enumerate().map(|(i, b)| (b.clone(), i)).collect();
    let mut by_phase: BTreeMap<u8, Vec<&BusVoltage>> = BTreeMap::new();
    for v in &voltages {
        by_phase.entry(v.phase).or_default().push(v);
    }

    let title = figure.title.clone().unwrap_or_else(|| {
        format!("Voltage Profile: {}", session.engine.circuit_name().unwrap_or_default())
    });
    let mut chart = Chart::new(title)
        .labels(
            opts.xlabel.clone().unwrap_or_else(|| "Bus".to_string()),
            opts.ylabel.clone().unwrap_or_else(|| "Voltage (pu)".to_string()),
        )
        .categories(buses)
        .grid(figure.grid);
    for (i, (phase, points)) in by_phase.iter().enumerate() {
        let color = PALETTE[i % PALETTE.len()];
        let colors = points
            .iter()
            .map(|v| {
                let violating = v.magnitude_pu < lo || v.magnitude_pu > hi;
                if figure.show_violations && violating {
                    VIOLATION_COLOR.to_string()
                } else {
                    color.to_string()
                }
            })
            .collect();
        let xy = points.iter().map(|v| (slot[&v.bus] as f64, v.magnitude_pu)).collect();
        chart = chart.series(
            Series::new(format!("Phase {phase}"), SeriesKind::Markers, xy)
                .color(color)
                .point_colors(colors),
        );
    }
    if figure.show_violations {
        chart = chart.hline(lo, format!("Min {lo:.2} pu")).hline(hi, format!("Max {hi:.2} pu"));
    }

    Ok((render_stacked(figure.width, figure.height, &[chart]), voltages.len()))
}

fn network_diagram(
    session: &Session,
    source: DataSource,
    figure: &Figure,
    opts: &PlotOptions,
) -> Result<(SvgDocument, usize), ToolError> {
    let circuit = session.circuit_name()?;
    let topology = session.engine.topology()?;
    let layout = match opts.layout.as_deref() {
        None => Layout::default(),
        Some(name) => name.parse::<Layout>().map_err(|_| {
            ToolError::InvalidInput(format!("Unknown layout '{name}'. Expected one of: tree, radial, spring"))
        })?,
    };

    let voltages = match source {
        DataSource::Circuit if !session.engine.is_solved() => Vec::new(),
        other => source_voltages(session, other)?,
    };
    let (lo, hi) = figure.limits;
    // color each bus by its phase furthest from nominal
    let mut worst: HashMap<String, f64> = HashMap::new();
    for v in &voltages {
        let entry = worst.entry(v.bus.clone()).or_insert(v.magnitude_pu);
        if (v.magnitude_pu - 1.0).abs() > (*entry - 1.0).abs() {
            *entry = v.magnitude_pu;
        }
    }
    let highlight: HashSet<String> = if figure.show_violations {
        worst
            .iter()
            .filter(|(_, v)| **v < lo || **v > hi)
            .map(|(bus, _)| bus.clone())
            .collect()
    } else {
        HashSet::new()
    };

    let style = DiagramStyle {
        title: figure
            .title
            .clone()
            .unwrap_or_else(|| format!("Network Diagram: {circuit}")),
        limits: (!worst.is_empty()).then_some(figure.limits),
        voltages: worst,
        highlight,
    };
    let positions = network::layout(&topology, layout);
    let mut doc = SvgDocument::new(figure.width, figure.height);
    let area = doc.bounds();
    let drawn = network::draw(&mut doc, area, &topology, &positions, &style);
    Ok((doc, drawn))
}

fn timeseries(session: &Session, figure: &Figure, opts: &PlotOptions) -> Result<(SvgDocument, usize), ToolError> {
    let ts = session
        .results
        .timeseries
        .as_ref()
        .ok_or_else(|| missing("time series", "run_time_series"))?;
    let variables: Vec<TimeseriesVariable> = match &opts.variables {
        None => TimeseriesVariable::DEFAULT.to_vec(),
        Some(names) if names.is_empty() => {
            return Err(ToolError::InvalidInput("variables must not be empty".to_string()))
        }
        Some(names) => names
            .iter()
            .map(|n| {
                n.parse().map_err(|_| {
                    ToolError::InvalidInput(format!(
                        "Unknown time series variable '{n}'. Expected one of: total_load_kw, losses_kw, \
                         min_voltage_pu, max_voltage_pu, load_multiplier"
                    ))
                })
            })
            .collect::<Result<_, _>>()?,
    };

    let xlabel = opts.xlabel.clone().unwrap_or_else(|| "Hour".to_string());
    let mut elements = 0;
    let charts: Vec<Chart> = variables
        .iter()
        .enumerate()
        .map(|(i, var)| {
            let points: Vec<(f64, f64)> = ts
                .timesteps
                .iter()
                .filter_map(|s| {
                    let y = match var {
                        TimeseriesVariable::TotalLoadKw => Some(s.total_load_kw),
                        TimeseriesVariable::LossesKw => s.losses_kw,
                        TimeseriesVariable::MinVoltagePu => s.min_voltage_pu,
                        TimeseriesVariable::MaxVoltagePu => s.max_voltage_pu,
                        TimeseriesVariable::LoadMultiplier => Some(s.load_multiplier),
                    }?;
                    Some((s.hour, y))
                })
                .collect();
            elements += points.len();
            let title = match (i, &figure.title) {
                (0, Some(t)) => t.clone(),
                (0, None) => format!("Time Series: {}", ts.profile_name),
                _ => String::new(),
            };
            let mut chart = Chart::new(title)
                .labels(xlabel.clone(), var.label())
                .grid(figure.grid)
                .series(Series::new(var.label(), SeriesKind::LineMarkers, points).color(PALETTE[i % PALETTE.len()]));
            let voltage_var = matches!(var, TimeseriesVariable::MinVoltagePu | TimeseriesVariable::MaxVoltagePu);
            if figure.show_violations && voltage_var {
                let (lo, hi) = figure.limits;
                chart = chart.hline(lo, format!("Min {lo:.2} pu")).hline(hi, format!("Max {hi:.2} pu"));
            }
            chart
        })
        .collect();

    Ok((render_stacked(figure.width, figure.height, &charts), elements))
}

fn capacity_curve(session: &Session, figure: &Figure, opts: &PlotOptions) -> Result<(SvgDocument, usize), ToolError> {
    let cap = session
        .results
        .capacity
        .as_ref()
        .ok_or_else(|| missing("hosting capacity", "analyze_capacity"))?;
    let xlabel = opts
        .xlabel
        .clone()
        .unwrap_or_else(|| format!("{} capacity at bus {} (kW)", cap.der_type, cap.bus_id));
    let marker_colors = |color: &str| -> Vec<String> {
        cap.capacity_curve
            .iter()
            .filter(|p| p.converged)
            .map(|p| {
                if figure.show_violations && p.has_violations {
                    VIOLATION_COLOR.to_string()
                } else {
                    color.to_string()
                }
            })
            .collect()
    };
    let converged: Vec<_> = cap.capacity_curve.iter().filter(|p| p.converged).collect();
    let pick = |f: fn(&crate::tools::capacity::CapacityPoint) -> Option<f64>| -> Vec<(f64, f64)> {
        converged.iter().filter_map(|p| Some((p.capacity_kw, f(p)?))).collect()
    };

    let title = figure
        .title
        .clone()
        .unwrap_or_else(|| format!("Hosting Capacity: {} kW", cap.max_capacity_kw));
    let mut voltage = Chart::new(title)
        .labels(xlabel.clone(), opts.ylabel.clone().unwrap_or_else(|| "Voltage (pu)".to_string()))
        .grid(figure.grid)
        .series(
            Series::new("Max voltage", SeriesKind::LineMarkers, pick(|p| p.max_voltage_pu))
                .color(PALETTE[1])
                .point_colors(marker_colors(PALETTE[1])),
        )
        .series(
            Series::new("Min voltage", SeriesKind::LineMarkers, pick(|p| p.min_voltage_pu))
                .color(PALETTE[0])
                .point_colors(marker_colors(PALETTE[0])),
        );
    let mut loading = Chart::new("")
        .labels(xlabel, "Max line loading (%)")
        .grid(figure.grid)
        .series(
            Series::new("Line loading", SeriesKind::LineMarkers, pick(|p| p.max_line_loading_pct))
                .color(PALETTE[2])
                .point_colors(marker_colors(PALETTE[2])),
        );
    if figure.show_violations {
        let c = &cap.constraints;
        voltage = voltage
            .hline(c.min_voltage_pu, format!("Min {:.2} pu", c.min_voltage_pu))
            .hline(c.max_voltage_pu, format!("Max {:.2} pu", c.max_voltage_pu));
        loading = loading.hline(c.max_line_loading_pct, format!("Limit {:.0}%", c.max_line_loading_pct));
    }
    if cap.limiting_constraint.is_some() {
        let label = format!("{} kW", cap.max_capacity_kw);
        voltage = voltage.vline(cap.max_capacity_kw, label.clone());
        loading = loading.vline(cap.max_capacity_kw, label);
    }

    Ok((
        render_stacked(figure.width, figure.height, &[voltage, loading]),
        converged.len(),
    ))
}

fn harmonics_spectrum(session: &Session, source: DataSource, figure: &Figure) -> Result<(SvgDocument, usize), ToolError> {
    let report = match source {
        DataSource::LastPowerFlow => session
            .results
            .power_flow
            .as_ref()
            .ok_or_else(|| missing("power flow", "run_power_flow"))?
            .harmonics
            .as_ref()
            .ok_or_else(|| {
                ToolError::MissingData("The last power flow ran without harmonic_analysis".to_string())
            })?,
        _ => session
            .results
            .harmonics
            .as_ref()
            .ok_or_else(|| missing("harmonics", "run_power_flow with harmonic_analysis"))?,
    };

    let buses: Vec<String> = report.thd_voltage.keys().cloned().collect();
    let thd: Vec<(f64, f64)> = report.thd_voltage.values().enumerate().map(|(i, v)| (i as f64, *v)).collect();
    let thd_colors = report
        .thd_voltage
        .values()
        .map(|v| {
            if figure.show_violations && *v > THD_LIMIT_PCT {
                VIOLATION_COLOR
            } else {
                PALETTE[0]
            }
            .to_string()
        })
        .collect();
    let mut elements = thd.len();
    let mut thd_chart = Chart::new(figure.title.clone().unwrap_or_else(|| "Voltage THD by Bus".to_string()))
        .labels("Bus", "THD (%)")
        .categories(buses)
        .grid(figure.grid)
        .series(Series::new("", SeriesKind::Bars, thd).point_colors(thd_colors));
    if figure.show_violations {
        thd_chart = thd_chart.hline(THD_LIMIT_PCT, format!("Limit {THD_LIMIT_PCT}%"));
    }
    let mut charts = vec![thd_chart];

    // spectrum of the most distorted bus, relative to its fundamental
    if let Some(bus) = &report.worst_thd_bus {
        let fundamental = report
            .individual_harmonics
            .get(&1)
            .and_then(|m| m.get(bus))
            .copied()
            .filter(|v| *v > 0.0);
        if let Some(h1) = fundamental {
            let bars: Vec<(f64, f64)> = report
                .individual_harmonics
                .iter()
                .filter_map(|(order, values)| Some((f64::from(*order), values.get(bus)? / h1 * 100.0)))
                .collect();
            elements += bars.len();
            charts.push(
                Chart::new(format!("Harmonic Spectrum at Bus {bus}"))
                    .labels("Harmonic order", "Magnitude (% of fundamental)")
                    .grid(figure.grid)
                    .series(Series::new("", SeriesKind::Bars, bars).color(PALETTE[1])),
            );
        }
    }

    Ok((render_stacked(figure.width, figure.height, &charts), elements))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{call_tool, parse};
    use serde_json::{json, Value};

    fn solved_session() -> Session {
        let mut session = Session::default();
        assert!(call_tool(&mut session, "load_feeder", json!({"feeder_id": "IEEE13"})).success);
        assert!(call_tool(&mut session, "run_power_flow", json!({})).success);
        session
    }

    fn viz(session: &mut Session, args: Value) -> Result<ToolOutput<VisualizationResult>, ToolError> {
        generate_visualization(session, parse(args)?)
    }

    #[test]
    fn test_voltage_profile_inline_svg() {
        let mut session = solved_session();
        let out = viz(&mut session, json!({"plot_type": "voltage_profile"})).unwrap();
        let r = &out.data;
        assert_eq!(r.format, "svg");
        assert_eq!(r.dimensions, Dimensions { width: 1000, height: 600 });
        assert_eq!(r.data_source, DataSource::Circuit);
        assert!(r.file_path.is_none());
        let svg = r.image_svg.as_deref().unwrap();
        assert!(svg.contains("<svg"));
        // the regulator bus sits above the upper limit
        assert!(svg.contains(VIOLATION_COLOR));
        assert!(r.elements_plotted > 16);
    }

    #[test]
    fn test_save_path_and_metadata_echo() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solved_session();
        session.config.visualization.output_dir = dir.path().to_path_buf();
        let out = viz(
            &mut session,
            json!({
                "plot_type": "voltage_profile",
                "data_source": "last_power_flow",
                "options": {"figsize": [16, 8], "dpi": 150, "title": "Profile", "save_path": "plots/profile.svg"}
            }),
        )
        .unwrap();
        assert_eq!(out.data.dimensions, Dimensions { width: 2400, height: 1200 });
        assert!(out.data.image_svg.is_none());
        let path = dir.path().join("plots/profile.svg");
        assert_eq!(out.data.file_path.as_deref(), Some(path.display().to_string().as_str()));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.len() > 1000);
        assert!(written.contains("Profile"));

        let meta = serde_json::to_value(&out.metadata).unwrap();
        assert_eq!(meta["figsize"], json!([16.0, 8.0]));
        assert_eq!(meta["dpi"], 150);
        assert_eq!(meta["title"], "Profile");
        assert_eq!(meta["data_source"], "last_power_flow");
    }

    #[test]
    fn test_network_layouts() {
        let mut session = solved_session();
        for layout in ["tree", "radial", "spring"] {
            let out = viz(
                &mut session,
                json!({"plot_type": "network_diagram", "options": {"layout": layout}}),
            )
            .unwrap();
            assert_eq!(out.data.elements_plotted, 16, "{layout}");
        }
        let err = viz(
            &mut session,
            json!({"plot_type": "network_diagram", "options": {"layout": "circular"}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown layout"));
    }

    #[test]
    fn test_network_diagram_before_solve() {
        let mut session = Session::default();
        assert!(call_tool(&mut session, "load_feeder", json!({"feeder_id": "IEEE13"})).success);
        let out = viz(&mut session, json!({"plot_type": "network_diagram"})).unwrap();
        assert_eq!(out.data.elements_plotted, 16);
    }

    #[test]
    fn test_unknown_plot_type_and_source() {
        let mut session = solved_session();
        let err = viz(&mut session, json!({"plot_type": "invalid_plot_type"})).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unknown plot type"));

        let err = viz(&mut session, json!({"plot_type": "voltage_profile", "data_source": "invalid_source"})).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unknown data source"));

        let err = viz(&mut session, json!({"plot_type": "capacity_curve", "data_source": "circuit"})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_results() {
        let mut session = solved_session();
        for plot in ["timeseries", "capacity_curve", "harmonics_spectrum"] {
            let err = viz(&mut session, json!({"plot_type": plot})).unwrap_err();
            assert!(matches!(err, ToolError::MissingData(_)), "{plot}: {err}");
        }
        let mut empty = Session::default();
        assert!(matches!(
            viz(&mut empty, json!({"plot_type": "voltage_profile"})),
            Err(ToolError::NoCircuit)
        ));
    }

    #[test]
    fn test_timeseries_variables() {
        let mut session = solved_session();
        assert!(call_tool(
            &mut session,
            "run_time_series",
            json!({"load_profile": {"multipliers": [0.6, 0.8, 1.0]}, "duration_hours": 6})
        )
        .success);
        let out = viz(
            &mut session,
            json!({"plot_type": "timeseries", "options": {"variables": ["total_load_kw", "losses_kw"]}}),
        )
        .unwrap();
        assert_eq!(out.data.elements_plotted, 12);

        let err = viz(&mut session, json!({"plot_type": "timeseries", "options": {"variables": ["pressure"]}})).unwrap_err();
        assert!(err.to_string().contains("pressure"));
    }

    #[test]
    fn test_capacity_and_harmonics_plots() {
        let mut session = solved_session();
        assert!(call_tool(
            &mut session,
            "analyze_capacity",
            json!({"bus_id": "675", "der_type": "solar", "increment_kw": 500, "max_capacity_kw": 5000})
        )
        .success);
        let out = viz(&mut session, json!({"plot_type": "capacity_curve"})).unwrap();
        assert!(out.data.elements_plotted > 0);

        assert!(call_tool(&mut session, "run_power_flow", json!({"options": {"harmonic_analysis": true}})).success);
        for source in ["last_harmonics", "last_power_flow"] {
            let out = viz(&mut session, json!({"plot_type": "harmonics_spectrum", "data_source": source})).unwrap();
            assert!(out.data.elements_plotted > 16, "{source}");
        }
    }

    #[test]
    fn test_bad_figure_options() {
        let mut session = solved_session();
        assert!(viz(&mut session, json!({"plot_type": "voltage_profile", "options": {"figsize": [10]}})).is_err());
        assert!(viz(&mut session, json!({"plot_type": "voltage_profile", "options": {"figsize": [0, 6]}})).is_err());
        assert!(viz(&mut session, json!({"plot_type": "voltage_profile", "options": {"dpi": 5}})).is_err());
        assert!(viz(
            &mut session,
            json!({"plot_type": "voltage_profile", "options": {"min_voltage_pu": 1.05, "max_voltage_pu": 0.95}})
        )
        .is_err());
    }
}
