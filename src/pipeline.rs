//! End-to-end run: load, label outliers, segment, mine rules, render

use crate::anomaly::{detect_outliers, normal_listings};
use crate::config::{PipelineConfig, ANOMALY_PLOT, ASSOCIATION_PLOT, CLUSTER_PLOT};
use crate::data::load_dataset;
use crate::rules::{AssociationRuleMiner, RuleSet};
use crate::segmentation::segment_listings;
use crate::viz::{self, ScatterPlot};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Listings after cleaning and sampling
    pub rows: usize,
    pub outliers: usize,
    /// Listings per cluster, indexed by cluster id
    pub cluster_sizes: Vec<usize>,
    pub inertia: f64,
    /// `None` when rule mining was unavailable
    pub rules: Option<RuleSet>,
    /// Artifacts written, in stage order
    pub artifacts: Vec<PathBuf>,
}

/// Run every stage with the capability resolved from `config`
pub fn run_pipeline(config: &PipelineConfig) -> crate::Result<PipelineReport> {
    let miner = AssociationRuleMiner::resolve(config);
    run_with_miner(config, &miner)
}

/// Run every stage with an explicitly chosen rule miner
pub fn run_with_miner(
    config: &PipelineConfig,
    miner: &AssociationRuleMiner,
) -> crate::Result<PipelineReport> {
    config.validate()?;
    let start = Instant::now();
    let mut artifacts = Vec::with_capacity(3);

    let dataset = load_dataset(config)?;

    let labeled = detect_outliers(&dataset, config)?;
    let outliers = labeled.iter().filter(|l| l.is_outlier()).count();
    write_artifact(
        &viz::anomaly_plot(&labeled),
        config,
        ANOMALY_PLOT,
        &mut artifacts,
    )?;

    let normal = normal_listings(&labeled);
    let segmentation = segment_listings(&normal, config)?;
    write_artifact(
        &viz::cluster_plot(&segmentation),
        config,
        CLUSTER_PLOT,
        &mut artifacts,
    )?;

    let rules = if miner.is_available() {
        let set = miner.mine(&normal, config)?;
        write_artifact(
            &viz::association_plot(&set.rules),
            config,
            ASSOCIATION_PLOT,
            &mut artifacts,
        )?;
        Some(set)
    } else {
        if let AssociationRuleMiner::Unavailable { reason } = miner {
            warn!(%reason, "association rules skipped");
        }
        None
    };

    info!(
        artifacts = artifacts.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "images generated"
    );

    Ok(PipelineReport {
        rows: dataset.len(),
        outliers,
        cluster_sizes: segmentation.cluster_sizes(),
        inertia: segmentation.inertia,
        rules,
        artifacts,
    })
}

fn write_artifact(
    plot: &ScatterPlot,
    config: &PipelineConfig,
    name: &str,
    written: &mut Vec<PathBuf>,
) -> crate::Result<()> {
    let path = config.artifact_path(name);
    debug!(path = %path.display(), title = %plot.title, "rendering");
    viz::render_scatter(plot, &path)?;
    written.push(path);
    Ok(())
}
