//! Command-line interface definitions and argument parsing

use crate::config::PipelineConfig;
use clap::Parser;
use std::path::PathBuf;

/// Generate the anomaly, segmentation and association plots for a used-car dataset
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input CSV file
    #[arg(short, long, default_value = "used_car_sales.csv")]
    pub input: PathBuf,

    /// Directory the PNG artifacts are written into
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Skip association rule mining and its plot
    #[arg(long)]
    pub no_association: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Pipeline configuration for these arguments; analysis constants stay fixed
    pub fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            association_enabled: !self.no_association,
            ..PipelineConfig::new(&self.input, &self.output_dir)
        }
    }

    /// Default log filter, overridden by `RUST_LOG`
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "carlens=debug"
        } else {
            "carlens=info"
        }
    }
}
