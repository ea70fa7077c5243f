//! carlens: renders the three market-analysis plots for the slide deck
//!
//! Parses arguments, installs logging and runs the pipeline once.

use anyhow::{Context, Result};
use carlens::{run_pipeline, Args};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_filter().into()),
        )
        .init();

    let config = args.to_config();
    let report = run_pipeline(&config)
        .with_context(|| format!("analysis of {} failed", config.input.display()))?;

    info!(
        rows = report.rows,
        outliers = report.outliers,
        clusters = ?report.cluster_sizes,
        rules = report.rules.as_ref().map_or(0, |set| set.rules.len()),
        "done"
    );
    for path in &report.artifacts {
        println!("{}", path.display());
    }

    Ok(())
}
