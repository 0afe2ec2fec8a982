//! SVG rendering for analysis results.

pub mod chart;
pub mod network;
pub mod svg;

pub use chart::{render_stacked, Chart, Series, SeriesKind};
pub use network::{DiagramStyle, Layout};
pub use svg::{Rect, SvgDocument};
