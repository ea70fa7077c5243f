//! carlens: used-car market analysis
//!
//! Cleans a table of used-car listings, labels price/mileage/year outliers
//! with an isolation forest, segments the remaining market with K-Means and
//! mines association rules that predict a price band. Each stage renders
//! one PNG artifact.

pub mod anomaly;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod rules;
pub mod segmentation;
pub mod stats;
pub mod viz;

// Re-export public items for easier access
pub use anomaly::{detect_outliers, IsolationForest, LabeledListing, OutlierStatus};
pub use cli::Args;
pub use config::PipelineConfig;
pub use data::{load_dataset, CleanedDataset, Listing};
pub use error::{InputError, PipelineError, Result, Stage};
pub use pipeline::{run_pipeline, run_with_miner, PipelineReport};
pub use rules::{AssociationRule, AssociationRuleMiner, RuleSet};
pub use segmentation::{segment_listings, SegmentedListing, Segmentation};
