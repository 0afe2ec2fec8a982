use std::fmt::Write;

/// Pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Shrink by the given margins (left, top, right, bottom).
    pub fn inset(&self, left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            x: self.x + left,
            y: self.y + top,
            w: (self.w - left - right).max(1.0),
            h: (self.h - top - bottom).max(1.0),
        }
    }

    /// Split into `n` equal rows.
    pub fn rows(&self, n: usize) -> Vec<Rect> {
        let n = n.max(1);
        let h = self.h / n as f64;
        (0..n).map(|i| Rect::new(self.x, self.y + h * i as f64, self.w, h)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Anchor {
    #[default]
    Start,
    Middle,
    End,
}

impl Anchor {
    fn as_str(self) -> &'static str {
        match self {
            Anchor::Start => "start",
            Anchor::Middle => "middle",
            Anchor::End => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stroke {
    pub color: String,
    pub width: f64,
    pub dash: Option<&'static str>,
}

impl Stroke {
    pub fn solid(color: impl Into<String>, width: f64) -> Self {
        Self {
            color: color.into(),
            width,
            dash: None,
        }
    }

    pub fn dashed(color: impl Into<String>, width: f64) -> Self {
        Self {
            color: color.into(),
            width,
            dash: Some("6,4"),
        }
    }

    fn attrs(&self) -> String {
        let mut s = format!(r#"stroke="{}" stroke-width="{:.2}""#, self.color, self.width);
        if let Some(dash) = self.dash {
            let _ = write!(s, r#" stroke-dasharray="{dash}""#);
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    pub size: f64,
    pub anchor: Anchor,
    pub bold: bool,
    pub rotate: Option<f64>,
    pub color: &'static str,
}

impl TextStyle {
    pub fn new(size: f64) -> Self {
        Self {
            size,
            anchor: Anchor::Start,
            bold: false,
            rotate: None,
            color: "#222222",
        }
    }

    pub fn anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    pub fn rotate(mut self, degrees: f64) -> Self {
        self.rotate = Some(degrees);
        self
    }
}

/// Minimal SVG writer. Elements are appended in paint order.
#[derive(Debug, Clone)]
pub struct SvgDocument {
    width: u32,
    height: u32,
    body: String,
    elements: usize,
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

impl SvgDocument {
    pub fn new(width: u32, height: u32) -> Self {
        let mut doc = Self {
            width,
            height,
            body: String::new(),
            elements: 0,
        };
        doc.rect(
            Rect::new(0.0, 0.0, f64::from(width), f64::from(height)),
            "#ffffff",
            None,
        );
        doc
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, f64::from(self.width), f64::from(self.height))
    }

    /// Number of drawn elements, background included.
    pub fn element_count(&self) -> usize {
        self.elements
    }

    pub fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, stroke: &Stroke) {
        self.elements += 1;
        let _ = writeln!(
            self.body,
            r#"<line x1="{x1:.2}" y1="{y1:.2}" x2="{x2:.2}" y2="{y2:.2}" {}/>"#,
            stroke.attrs()
        );
    }

    pub fn polyline(&mut self, points: &[(f64, f64)], stroke: &Stroke) {
        if points.len() < 2 {
            return;
        }
        self.elements += 1;
        let coords: Vec<String> = points.iter().map(|(x, y)| format!("{x:.2},{y:.2}")).collect();
        let _ = writeln!(
            self.body,
            r#"<polyline points="{}" fill="none" {}/>"#,
            coords.join(" "),
            stroke.attrs()
        );
    }

    pub fn rect(&mut self, r: Rect, fill: &str, stroke: Option<&Stroke>) {
        self.elements += 1;
        let stroke = stroke.map(|s| format!(" {}", s.attrs())).unwrap_or_default();
        let _ = writeln!(
            self.body,
            r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="{fill}"{stroke}/>"#,
            r.x, r.y, r.w, r.h
        );
    }

    pub fn circle(&mut self, cx: f64, cy: f64, r: f64, fill: &str, stroke: Option<&Stroke>) {
        self.elements += 1;
        let stroke = stroke.map(|s| format!(" {}", s.attrs())).unwrap_or_default();
        let _ = writeln!(
            self.body,
            r#"<circle cx="{cx:.2}" cy="{cy:.2}" r="{r:.2}" fill="{fill}"{stroke}/>"#
        );
    }

    pub fn text(&mut self, x: f64, y: f64, content: &str, style: &TextStyle) {
        self.elements += 1;
        let weight = if style.bold { r#" font-weight="bold""# } else { "" };
        let transform = style
            .rotate
            .map(|deg| format!(r#" transform="rotate({deg:.1} {x:.2} {y:.2})""#))
            .unwrap_or_default();
        let _ = writeln!(
            self.body,
            r#"<text x="{x:.2}" y="{y:.2}" font-family="sans-serif" font-size="{:.1}" fill="{}" text-anchor="{}"{weight}{transform}>{}</text>"#,
            style.size,
            style.color,
            style.anchor.as_str(),
            escape(content)
        );
    }

    pub fn finish(self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">\n{body}</svg>\n",
            w = self.width,
            h = self.height,
            body = self.body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_shell() {
        let mut doc = SvgDocument::new(640, 480);
        doc.line(0.0, 0.0, 10.0, 10.0, &Stroke::solid("#000", 1.0));
        assert_eq!(doc.element_count(), 2);
        let svg = doc.finish();
        assert!(svg.starts_with("<?xml"));
        assert!(svg.contains(r#"width="640" height="480""#));
        assert!(svg.trim_end().ends_with("</svg>"));
    }

    #[test]
    fn test_text_is_escaped() {
        let mut doc = SvgDocument::new(10, 10);
        doc.text(0.0, 0.0, "V < 0.95 & \"low\"", &TextStyle::new(10.0));
        let svg = doc.finish();
        assert!(svg.contains("V &lt; 0.95 &amp; &quot;low&quot;"));
    }

    #[test]
    fn test_single_point_polyline_skipped() {
        let mut doc = SvgDocument::new(10, 10);
        doc.polyline(&[(1.0, 1.0)], &Stroke::solid("#000", 1.0));
        assert_eq!(doc.element_count(), 1);
    }

    #[test]
    fn test_rect_rows() {
        let rows = Rect::new(0.0, 0.0, 100.0, 90.0).rows(3);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].y, 60.0);
        assert_eq!(rows[1].h, 30.0);
    }
}
