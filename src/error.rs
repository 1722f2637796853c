use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a pipeline run for one submission.
///
/// None of these are retried; the runner stops at the first stage that
/// returns one.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required logical column could not be located in the table.
    #[error("could not resolve column for '{field}'; available columns: [{}]", .available.join(", "))]
    Schema {
        field: String,
        available: Vec<String>,
    },

    /// A cleaning or feature step removed every row.
    #[error("{stage} removed all rows ({before} rows before, {after} after)")]
    EmptyResult {
        stage: String,
        before: usize,
        after: usize,
    },

    /// A dependent stage's input artifact does not exist at any attempted path.
    #[error("missing input artifact for stage '{stage}'; tried: {}", display_paths(.attempted))]
    MissingArtifact {
        stage: String,
        attempted: Vec<PathBuf>,
    },

    /// Degenerate input to the regression or the outlier model.
    #[error("model fit error: {0}")]
    ModelFit(String),

    /// A required cell could not be interpreted as the expected type.
    #[error("invalid value '{value}' in column '{column}' at row {row}")]
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl PipelineError {
    /// Wrap an I/O error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;
