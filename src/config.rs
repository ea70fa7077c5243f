//! Pipeline configuration and the fixed analysis constants

use crate::error::{PipelineError, Stage};
use std::path::PathBuf;

/// Artifact written by the anomaly stage
pub const ANOMALY_PLOT: &str = "anomaly_plot.png";
/// Artifact written by the segmentation stage
pub const CLUSTER_PLOT: &str = "cluster_plot.png";
/// Artifact written by the association stage
pub const ASSOCIATION_PLOT: &str = "association_plot.png";

/// Raw column names in the source file, paired with their canonical names
pub const COLUMN_MAP: [(&str, &str); 7] = [
    ("Price-$", "price"),
    ("Manufactured Year", "year"),
    ("Mileage-KM", "mileage"),
    ("Energy", "fuel"),
    ("Gearbox", "gearbox"),
    ("Car Type", "car_type"),
    ("Engine Power-HP", "engine_hp"),
];

/// Every knob of a run. `Default` holds the values the report was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Input CSV path
    pub input: PathBuf,
    /// Directory the three PNG files are written into
    pub output_dir: PathBuf,
    /// Field separator of the input file
    pub separator: u8,
    /// Seed shared by sampling, the isolation forest and k-means
    pub seed: u64,
    /// Maximum number of rows kept after cleaning
    pub sample_cap: usize,
    /// Expected share of outliers
    pub contamination: f64,
    /// Trees in the isolation forest
    pub n_estimators: usize,
    /// Rows drawn per isolation tree
    pub max_samples: usize,
    /// Number of market segments
    pub n_clusters: usize,
    /// k-means iteration limit per run
    pub max_iterations: u64,
    /// k-means convergence tolerance
    pub tolerance: f64,
    /// k-means restarts; the best inertia wins
    pub n_runs: usize,
    /// Equal-frequency bins for price and mileage
    pub n_bins: usize,
    /// Right-closed year bin edges
    pub year_edges: Vec<i64>,
    /// Apriori minimum support
    pub min_support: f64,
    /// Minimum lift for a rule to be kept
    pub min_lift: f64,
    /// Rules kept for the bubble plot
    pub max_rules: usize,
    /// Run the association stage when the capability is compiled in
    pub association_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("used_car_sales.csv"),
            output_dir: PathBuf::from("."),
            separator: b',',
            seed: 42,
            sample_cap: 2000,
            contamination: 0.05,
            n_estimators: 100,
            max_samples: 256,
            n_clusters: 5,
            max_iterations: 300,
            tolerance: 1e-4,
            n_runs: 10,
            n_bins: 3,
            year_edges: vec![1990, 2010, 2018, 2025],
            min_support: 0.05,
            min_lift: 1.2,
            max_rules: 15,
            association_enabled: true,
        }
    }
}

impl PipelineConfig {
    /// Config reading `input` and writing into `output_dir`, defaults elsewhere
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Reject values the stages cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: String| Err(PipelineError::stage(Stage::Config, msg));

        if self.sample_cap == 0 {
            return fail("sample cap must be positive".to_string());
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return fail(format!(
                "contamination {} must lie in (0, 0.5]",
                self.contamination
            ));
        }
        if self.n_estimators == 0 || self.max_samples == 0 {
            return fail("isolation forest needs at least one tree and one sample".to_string());
        }
        if self.n_clusters == 0 || self.n_runs == 0 {
            return fail("k-means needs at least one cluster and one run".to_string());
        }
        if self.n_bins < 2 {
            return fail(format!("{} bins cannot separate anything", self.n_bins));
        }
        if self.year_edges.len() != 4 || self.year_edges.windows(2).any(|w| w[0] >= w[1]) {
            return fail(format!(
                "year edges {:?} must be four strictly increasing values",
                self.year_edges
            ));
        }
        if !(self.min_support > 0.0 && self.min_support <= 1.0) {
            return fail(format!("min support {} must lie in (0, 1]", self.min_support));
        }
        if self.min_lift < 0.0 {
            return fail(format!("min lift {} must be non-negative", self.min_lift));
        }
        Ok(())
    }
}
