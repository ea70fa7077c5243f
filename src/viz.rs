//! Scatter and bubble plots rendered to PNG with Plotters

use crate::anomaly::{LabeledListing, OutlierStatus};
use crate::error::PipelineError;
use crate::rules::AssociationRule;
use crate::segmentation::Segmentation;
use crate::stats::finite_range;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::register_font;
use std::ops::Range;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

/// Image size of every artifact
const PLOT_SIZE: (u32, u32) = (1000, 600);

/// Family every caption, label and legend is drawn with
const FONT_FAMILY: &str = "sans-serif";

/// DejaVu Sans, bundled so rendering needs no system fonts
static FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

static FONT_REGISTERED: OnceLock<bool> = OnceLock::new();

/// Register the bundled font under [`FONT_FAMILY`]; false if it failed to parse
fn ensure_font() -> bool {
    *FONT_REGISTERED
        .get_or_init(|| register_font(FONT_FAMILY, FontStyle::Normal, FONT_DATA).is_ok())
}

/// Anchors of the viridis colormap
const VIRIDIS: [RGBColor; 5] = [
    RGBColor(68, 1, 84),
    RGBColor(59, 82, 139),
    RGBColor(33, 145, 140),
    RGBColor(94, 201, 98),
    RGBColor(253, 231, 37),
];

/// Points sharing one color, size and legend entry
#[derive(Debug, Clone)]
pub struct Series {
    pub label: Option<String>,
    pub color: RGBColor,
    pub radius: u32,
    pub points: Vec<(f64, f64)>,
}

/// Visual encoding of one artifact
#[derive(Debug, Clone)]
pub struct ScatterPlot {
    pub title: String,
    pub x_desc: String,
    pub y_desc: String,
    pub series: Vec<Series>,
}

impl ScatterPlot {
    pub fn point_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }

    /// Data bounds with 5% padding; unit range when there is nothing to show
    fn ranges(&self) -> (Range<f64>, Range<f64>) {
        let points = || self.series.iter().flat_map(|s| s.points.iter());
        (
            padded(finite_range(points().map(|p| p.0))),
            padded(finite_range(points().map(|p| p.1))),
        )
    }
}

fn padded(range: Option<(f64, f64)>) -> Range<f64> {
    match range {
        None => 0.0..1.0,
        Some((lo, hi)) if hi - lo <= f64::EPSILON * hi.abs().max(1.0) => {
            let pad = (lo.abs() * 0.05).max(0.5);
            (lo - pad)..(hi + pad)
        }
        Some((lo, hi)) => {
            let pad = (hi - lo) * 0.05;
            (lo - pad)..(hi + pad)
        }
    }
}

/// Color at `t` in [0, 1] along viridis
pub fn viridis(t: f64) -> RGBColor {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = t * (VIRIDIS.len() - 1) as f64;
    let lower = (scaled.floor() as usize).min(VIRIDIS.len() - 2);
    let fraction = scaled - lower as f64;
    let (a, b) = (VIRIDIS[lower], VIRIDIS[lower + 1]);
    let lerp = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * fraction).round() as u8;
    RGBColor(lerp(a.0, b.0), lerp(a.1, b.1), lerp(a.2, b.2))
}

/// Render `plot` as a PNG at `path`
pub fn render_scatter(plot: &ScatterPlot, path: &Path) -> crate::Result<()> {
    write_png(plot, path).map_err(|e| PipelineError::Render {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    info!(
        path = %path.display(),
        points = plot.point_count(),
        "artifact written"
    );
    Ok(())
}

fn write_png(plot: &ScatterPlot, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::new(path, PLOT_SIZE).into_drawing_area();
    draw_scatter(plot, &root)?;
    root.present()?;
    Ok(())
}

fn draw_scatter<DB>(
    plot: &ScatterPlot,
    root: &DrawingArea<DB, Shift>,
) -> Result<(), Box<dyn std::error::Error>>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    if !ensure_font() {
        return Err("bundled font could not be loaded".into());
    }
    let (x_range, y_range) = plot.ranges();

    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(root)
        .caption(&plot.title, (FONT_FAMILY, 28))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(80)
        .build_cartesian_2d(x_range, y_range)?;

    chart
        .configure_mesh()
        .x_desc(plot.x_desc.as_str())
        .y_desc(plot.y_desc.as_str())
        .axis_desc_style((FONT_FAMILY, 16))
        .label_style((FONT_FAMILY, 12))
        .draw()?;

    for series in &plot.series {
        let color = series.color;
        let radius = series.radius;
        let annotation = chart.draw_series(
            series
                .points
                .iter()
                .map(|&point| Circle::new(point, radius, color.mix(0.75).filled())),
        )?;
        if let Some(label) = &series.label {
            annotation
                .label(label.as_str())
                .legend(move |(x, y)| Circle::new((x, y), 5, color.filled()));
        }
    }

    if plot.series.iter().any(|s| s.label.is_some()) {
        chart
            .configure_series_labels()
            .label_font((FONT_FAMILY, 14))
            .background_style(WHITE.mix(0.85))
            .border_style(BLACK)
            .draw()?;
    }

    Ok(())
}

/// Mileage vs price, normal listings in blue and outliers in red
pub fn anomaly_plot(labeled: &[LabeledListing]) -> ScatterPlot {
    let points_for = |status: OutlierStatus| -> Vec<(f64, f64)> {
        labeled
            .iter()
            .filter(|l| l.status == status)
            .map(|l| (l.listing.mileage, l.listing.price))
            .collect()
    };

    ScatterPlot {
        title: "Anomaly Detection: High Price outliers vs Mileage".to_string(),
        x_desc: "Mileage (KM)".to_string(),
        y_desc: "Price ($)".to_string(),
        series: vec![
            Series {
                label: Some("Normal".to_string()),
                color: BLUE,
                radius: 4,
                points: points_for(OutlierStatus::Normal),
            },
            Series {
                label: Some("Outlier".to_string()),
                color: RED,
                radius: 4,
                points: points_for(OutlierStatus::Outlier),
            },
        ],
    }
}

/// Mileage vs price colored by cluster id
pub fn cluster_plot(segmentation: &Segmentation) -> ScatterPlot {
    let k = segmentation.n_clusters;
    let series = (0..k)
        .map(|cluster| Series {
            label: Some(format!("Cluster {cluster}")),
            color: viridis(if k > 1 {
                cluster as f64 / (k - 1) as f64
            } else {
                0.0
            }),
            radius: 6,
            points: segmentation
                .listings
                .iter()
                .filter(|s| s.cluster_id == cluster)
                .map(|s| (s.listing.mileage, s.listing.price))
                .collect(),
        })
        .collect();

    ScatterPlot {
        title: format!("Car Market Segmentation ({k} Clusters)"),
        x_desc: "Mileage (KM)".to_string(),
        y_desc: "Price ($)".to_string(),
        series,
    }
}

/// Support vs confidence, bubble radius and color by lift
pub fn association_plot(rules: &[AssociationRule]) -> ScatterPlot {
    let (lo, hi) = finite_range(rules.iter().map(|r| r.lift)).unwrap_or((0.0, 0.0));
    let span = hi - lo;

    let series = rules
        .iter()
        .map(|rule| {
            let t = if span > 0.0 { (rule.lift - lo) / span } else { 0.5 };
            Series {
                label: None,
                color: viridis(t),
                radius: 6 + (t * 8.0).round() as u32,
                points: vec![(rule.support, rule.confidence)],
            }
        })
        .collect();

    ScatterPlot {
        title: "Top Association Rules (Bubble Size = Lift)".to_string(),
        x_desc: "support".to_string(),
        y_desc: "confidence".to_string(),
        series,
    }
}
