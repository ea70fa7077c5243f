//! Error types for the analysis pipeline

use polars::prelude::PolarsError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline stage, used to attribute failures and log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Load,
    Anomaly,
    Segmentation,
    Association,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Load => "load",
            Stage::Anomaly => "anomaly",
            Stage::Segmentation => "segmentation",
            Stage::Association => "association",
        };
        f.write_str(name)
    }
}

/// Problems with the input table. Always fatal.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },

    #[error("required column '{column}' is missing")]
    MissingColumn { column: String },

    #[error("no rows left after cleaning")]
    Empty,

    #[error("malformed table: {0}")]
    Frame(#[from] PolarsError),
}

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error("association rule mining unavailable: {reason}")]
    CapabilityUnavailable { reason: String },

    #[error("failed to render {}: {message}", path.display())]
    Render { path: PathBuf, message: String },

    #[error("{stage} stage failed: {message}")]
    Stage { stage: Stage, message: String },
}

impl PipelineError {
    pub(crate) fn stage(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage,
            message: message.into(),
        }
    }

    /// True for errors the driver absorbs instead of aborting the run
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::CapabilityUnavailable { .. })
    }
}

impl From<PolarsError> for PipelineError {
    fn from(err: PolarsError) -> Self {
        PipelineError::Input(InputError::Frame(err))
    }
}
