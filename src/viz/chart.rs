//! Cartesian charts drawn into a region of an [`SvgDocument`].

use super::svg::{Anchor, Rect, Stroke, SvgDocument, TextStyle};

pub const PALETTE: [&str; 6] = ["#1f77b4", "#ff7f0e", "#2ca02c", "#9467bd", "#8c564b", "#17becf"];
pub const VIOLATION_COLOR: &str = "#d62728";
pub const LIMIT_COLOR: &str = "#d62728";
const GRID_COLOR: &str = "#e0e0e0";
const AXIS_COLOR: &str = "#444444";

/// Categorical axes label at most this many ticks.
const MAX_CATEGORY_LABELS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    Line,
    Markers,
    LineMarkers,
    Bars,
}

#[derive(Debug, Clone)]
pub struct Series {
    pub label: String,
    pub points: Vec<(f64, f64)>,
    pub kind: SeriesKind,
    pub color: String,
    /// Per-point marker/bar colors overriding `color`.
    pub point_colors: Option<Vec<String>>,
}

impl Series {
    pub fn new(label: impl Into<String>, kind: SeriesKind, points: Vec<(f64, f64)>) -> Self {
        Self {
            label: label.into(),
            points,
            kind,
            color: PALETTE[0].to_string(),
            point_colors: None,
        }
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn point_colors(mut self, colors: Vec<String>) -> Self {
        self.point_colors = Some(colors);
        self
    }

    fn color_at(&self, i: usize) -> &str {
        self.point_colors
            .as_ref()
            .and_then(|c| c.get(i))
            .map(String::as_str)
            .unwrap_or(&self.color)
    }
}

#[derive(Debug, Clone)]
pub struct RefLine {
    pub value: f64,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct Chart {
    pub title: String,
    pub xlabel: String,
    pub ylabel: String,
    pub series: Vec<Series>,
    pub hlines: Vec<RefLine>,
    pub vlines: Vec<RefLine>,
    /// Category names for x positions 0, 1, 2, ...
    pub categories: Option<Vec<String>>,
    pub grid: bool,
}

impl Chart {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            grid: true,
            ..Default::default()
        }
    }

    pub fn labels(mut self, xlabel: impl Into<String>, ylabel: impl Into<String>) -> Self {
        self.xlabel = xlabel.into();
        self.ylabel = ylabel.into();
        self
    }

    pub fn series(mut self, series: Series) -> Self {
        self.series.push(series);
        self
    }

    pub fn hline(mut self, value: f64, label: impl Into<String>) -> Self {
        self.hlines.push(RefLine {
            value,
            label: label.into(),
        });
        self
    }

    pub fn vline(mut self, value: f64, label: impl Into<String>) -> Self {
        self.vlines.push(RefLine {
            value,
            label: label.into(),
        });
        self
    }

    pub fn categories(mut self, names: Vec<String>) -> Self {
        self.categories = Some(names);
        self
    }

    pub fn grid(mut self, on: bool) -> Self {
        self.grid = on;
        self
    }

    fn x_range(&self) -> (f64, f64) {
        if let Some(cats) = &self.categories {
            return (-0.5, cats.len().max(1) as f64 - 0.5);
        }
        let xs = self
            .series
            .iter()
            .flat_map(|s| s.points.iter().map(|p| p.0))
            .chain(self.vlines.iter().map(|l| l.value));
        padded_range(xs, 0.02)
    }

    fn y_range(&self) -> (f64, f64) {
        let has_bars = self.series.iter().any(|s| s.kind == SeriesKind::Bars);
        let ys = self
            .series
            .iter()
            .flat_map(|s| s.points.iter().map(|p| p.1))
            .chain(self.hlines.iter().map(|l| l.value))
            .chain(has_bars.then_some(0.0));
        padded_range(ys, 0.08)
    }

    /// Draw the chart inside `area` (title and axis labels included).
    pub fn draw(&self, doc: &mut SvgDocument, area: Rect) {
        let font = (area.h / 28.0).clamp(9.0, 16.0);
        let bottom = if self.categories.is_some() { font * 5.5 } else { font * 3.2 };
        let plot = area.inset(font * 5.0, font * 2.4, font * 1.5, bottom);

        if !self.title.is_empty() {
            doc.text(
                area.x + area.w / 2.0,
                area.y + font * 1.5,
                &self.title,
                &TextStyle::new(font * 1.15).anchor(Anchor::Middle).bold(),
            );
        }

        let (x0, x1) = self.x_range();
        let (y0, y1) = self.y_range();
        let map = Mapping { plot, x0, x1, y0, y1 };

        self.draw_axes(doc, &map, font);

        for line in &self.hlines {
            let y = map.y(line.value);
            doc.line(plot.x, y, plot.x + plot.w, y, &Stroke::dashed(LIMIT_COLOR, 1.2));
            doc.text(
                plot.x + plot.w - 4.0,
                y - 4.0,
                &line.label,
                &TextStyle::new(font * 0.8).anchor(Anchor::End),
            );
        }
        for line in &self.vlines {
            let x = map.x(line.value);
            doc.line(x, plot.y, x, plot.y + plot.h, &Stroke::dashed("#555555", 1.2));
            doc.text(x + 4.0, plot.y + font, &line.label, &TextStyle::new(font * 0.8));
        }

        let bar_series = self.series.iter().filter(|s| s.kind == SeriesKind::Bars).count().max(1);
        let mut bar_index = 0;
        for series in &self.series {
            match series.kind {
                SeriesKind::Bars => {
                    self.draw_bars(doc, &map, series, bar_index, bar_series);
                    bar_index += 1;
                }
                SeriesKind::Line | SeriesKind::LineMarkers | SeriesKind::Markers => {
                    let pts: Vec<(f64, f64)> = series.points.iter().map(|&(x, y)| (map.x(x), map.y(y))).collect();
                    if series.kind != SeriesKind::Markers {
                        doc.polyline(&pts, &Stroke::solid(series.color.clone(), 1.8));
                    }
                    if series.kind != SeriesKind::Line {
                        let r = (plot.w / (pts.len().max(1) as f64) / 4.0).clamp(1.5, 4.0);
                        for (i, (x, y)) in pts.iter().enumerate() {
                            doc.circle(*x, *y, r, series.color_at(i), None);
                        }
                    }
                }
            }
        }

        self.draw_legend(doc, plot, font);
    }

    fn draw_axes(&self, doc: &mut SvgDocument, map: &Mapping, font: f64) {
        let plot = map.plot;
        let axis = Stroke::solid(AXIS_COLOR, 1.0);
        let tick_style = TextStyle::new(font * 0.8);

        for y in nice_ticks(map.y0, map.y1, 6) {
            let py = map.y(y);
            if self.grid {
                doc.line(plot.x, py, plot.x + plot.w, py, &Stroke::solid(GRID_COLOR, 0.8));
            }
            doc.text(plot.x - 6.0, py + font * 0.3, &format_tick(y), &tick_style.clone().anchor(Anchor::End));
        }

        match &self.categories {
            Some(names) => {
                let step = names.len().div_ceil(MAX_CATEGORY_LABELS).max(1);
                for (i, name) in names.iter().enumerate().step_by(step) {
                    let px = map.x(i as f64);
                    doc.text(
                        px,
                        plot.y + plot.h + font,
                        name,
                        &tick_style.clone().anchor(Anchor::End).rotate(-45.0),
                    );
                }
            }
            None => {
                for x in nice_ticks(map.x0, map.x1, 8) {
                    let px = map.x(x);
                    if self.grid {
                        doc.line(px, plot.y, px, plot.y + plot.h, &Stroke::solid(GRID_COLOR, 0.8));
                    }
                    doc.text(
                        px,
                        plot.y + plot.h + font * 1.2,
                        &format_tick(x),
                        &tick_style.clone().anchor(Anchor::Middle),
                    );
                }
            }
        }

        doc.line(plot.x, plot.y + plot.h, plot.x + plot.w, plot.y + plot.h, &axis);
        doc.line(plot.x, plot.y, plot.x, plot.y + plot.h, &axis);

        if !self.xlabel.is_empty() {
            let offset = if self.categories.is_some() { font * 5.0 } else { font * 2.7 };
            doc.text(
                plot.x + plot.w / 2.0,
                plot.y + plot.h + offset,
                &self.xlabel,
                &TextStyle::new(font * 0.9).anchor(Anchor::Middle),
            );
        }
        if !self.ylabel.is_empty() {
            let x = plot.x - font * 4.0;
            let y = plot.y + plot.h / 2.0;
            doc.text(x, y, &self.ylabel, &TextStyle::new(font * 0.9).anchor(Anchor::Middle).rotate(-90.0));
        }
    }

    fn draw_bars(&self, doc: &mut SvgDocument, map: &Mapping, series: &Series, index: usize, count: usize) {
        let slot = if self.categories.is_some() {
            map.plot.w / (map.x1 - map.x0)
        } else {
            let mut xs: Vec<f64> = series.points.iter().map(|p| p.0).collect();
            xs.sort_by(f64::total_cmp);
            let min_gap = xs.windows(2).map(|w| w[1] - w[0]).filter(|g| *g > 0.0).fold(f64::INFINITY, f64::min);
            let gap = if min_gap.is_finite() { min_gap } else { (map.x1 - map.x0) / 10.0 };
            gap / (map.x1 - map.x0) * map.plot.w
        };
        let width = (slot * 0.75 / count as f64).max(1.0);
        let base = map.y(map.y0.max(0.0).min(map.y1));
        for (i, &(x, y)) in series.points.iter().enumerate() {
            let px = map.x(x) - slot * 0.375 + width * index as f64;
            let py = map.y(y);
            let (top, h) = if py < base { (py, base - py) } else { (base, py - base) };
            doc.rect(Rect::new(px, top, width, h.max(0.5)), series.color_at(i), None);
        }
    }

    fn draw_legend(&self, doc: &mut SvgDocument, plot: Rect, font: f64) {
        let labelled: Vec<&Series> = self.series.iter().filter(|s| !s.label.is_empty()).collect();
        if labelled.len() < 2 {
            return;
        }
        let line_h = font * 1.2;
        let width = labelled.iter().map(|s| s.label.len()).max().unwrap_or(0) as f64 * font * 0.55 + font * 2.5;
        let frame = Rect::new(plot.x + plot.w - width - 6.0, plot.y + 6.0, width, line_h * labelled.len() as f64 + 6.0);
        doc.rect(frame, "#ffffff", Some(&Stroke::solid("#bbbbbb", 0.8)));
        for (i, s) in labelled.iter().enumerate() {
            let y = frame.y + 3.0 + line_h * (i as f64 + 0.5);
            doc.rect(Rect::new(frame.x + 6.0, y - font * 0.35, font * 0.9, font * 0.7), &s.color, None);
            doc.text(frame.x + font * 1.8, y + font * 0.3, &s.label, &TextStyle::new(font * 0.8));
        }
    }
}

struct Mapping {
    plot: Rect,
    x0: f64,
    x1: f64,
    y0: f64,
    y1: f64,
}

impl Mapping {
    fn x(&self, x: f64) -> f64 {
        self.plot.x + (x - self.x0) / (self.x1 - self.x0) * self.plot.w
    }

    fn y(&self, y: f64) -> f64 {
        self.plot.y + self.plot.h - (y - self.y0) / (self.y1 - self.y0) * self.plot.h
    }
}

/// Data range padded by `pad` of its span. Never degenerate.
fn padded_range(values: impl Iterator<Item = f64>, pad: f64) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let span = hi - lo;
    if span <= f64::EPSILON * hi.abs().max(1.0) {
        let half = (hi.abs() * 0.05).max(0.5);
        return (lo - half, hi + half);
    }
    (lo - span * pad, hi + span * pad)
}

/// Round tick positions covering [lo, hi], roughly `target` of them.
pub fn nice_ticks(lo: f64, hi: f64, target: usize) -> Vec<f64> {
    if !(hi > lo) || target == 0 {
        return vec![lo];
    }
    let raw = (hi - lo) / target as f64;
    let magnitude = 10f64.powf(raw.log10().floor());
    let step = [1.0, 2.0, 2.5, 5.0, 10.0]
        .iter()
        .map(|m| m * magnitude)
        .find(|s| *s >= raw)
        .unwrap_or(10.0 * magnitude);
    let first = (lo / step).ceil() * step;
    let mut ticks = Vec::new();
    let mut t = first;
    while t <= hi + step * 1e-9 {
        ticks.push(if t.abs() < step * 1e-9 { 0.0 } else { t });
        t += step;
    }
    ticks
}

fn format_tick(v: f64) -> String {
    let a = v.abs();
    if a == 0.0 {
        "0".to_string()
    } else if a >= 1000.0 {
        format!("{v:.0}")
    } else if a >= 10.0 {
        format!("{v:.1}")
    } else if a >= 1.0 {
        format!("{v:.2}")
    } else {
        format!("{v:.3}")
    }
}

/// Render charts stacked vertically in one document.
pub fn render_stacked(width: u32, height: u32, charts: &[Chart]) -> SvgDocument {
    let mut doc = SvgDocument::new(width, height);
    let bounds = doc.bounds();
    for (chart, area) in charts.iter().zip(bounds.rows(charts.len())) {
        chart.draw(&mut doc, area);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nice_ticks() {
        let ticks = nice_ticks(0.93, 1.07, 6);
        assert!(ticks.len() >= 4 && ticks.len() <= 10, "{ticks:?}");
        assert!(ticks.iter().all(|t| *t >= 0.93 - 1e-9 && *t <= 1.07 + 1e-9));
        assert_eq!(nice_ticks(0.0, 100.0, 5), vec![0.0, 20.0, 40.0, 60.0, 80.0, 100.0]);
    }

    #[test]
    fn test_degenerate_range_expanded() {
        let (lo, hi) = padded_range([1.0, 1.0].into_iter(), 0.1);
        assert!(lo < 1.0 && hi > 1.0);
        assert_eq!(padded_range(std::iter::empty(), 0.1), (0.0, 1.0));
    }

    #[test]
    fn test_chart_renders_series_and_limits() {
        let chart = Chart::new("Voltage")
            .labels("Bus", "Voltage (pu)")
            .categories(vec!["a".into(), "b".into(), "c".into()])
            .series(
                Series::new("phase 1", SeriesKind::LineMarkers, vec![(0.0, 1.0), (1.0, 0.97), (2.0, 0.94)])
                    .point_colors(vec![PALETTE[0].into(), PALETTE[0].into(), VIOLATION_COLOR.into()]),
            )
            .hline(0.95, "min 0.95")
            .hline(1.05, "max 1.05");
        let svg = render_stacked(800, 600, &[chart]).finish();
        assert!(svg.contains("Voltage (pu)"));
        assert!(svg.contains("min 0.95"));
        assert!(svg.contains(VIOLATION_COLOR));
        assert!(svg.contains("<polyline"));
    }

    #[test]
    fn test_bars_start_at_zero() {
        let chart = Chart::new("").series(Series::new("", SeriesKind::Bars, vec![(3.0, 2.0), (5.0, 4.0)]));
        assert_eq!(chart.y_range().0 <= 0.0, true);
        let doc = render_stacked(400, 300, &[chart]);
        assert!(doc.element_count() > 3);
    }
}
