//! Analytics stages, in pipeline order.
//!
//! ```text
//!  raw table ──clean──▶ cleaned ──features──▶ features ──trend──▶ flagged
//!                                                                    │
//!                      alerts ◀──yearly── flagged ──anomaly──▶ anomalies
//! ```
//!
//! Each stage is a pure `Table -> Table` transformation; reading and
//! persisting artifacts is the pipeline runner's job.

pub mod anomaly;
pub mod clean;
pub mod features;
pub mod trend;
pub mod yearly;

use crate::data::model::{Table, Value};
use crate::error::{PipelineError, Result};

/// Read a column as `f64`, failing on the first cell that is not numeric.
pub(crate) fn numeric_column(table: &Table, idx: usize) -> Result<Vec<f64>> {
    table
        .column(idx)
        .enumerate()
        .map(|(row, v)| {
            v.as_f64().ok_or_else(|| invalid(table, idx, row, v))
        })
        .collect()
}

/// Read a column as whole numbers (reporting years).
pub(crate) fn integer_column(table: &Table, idx: usize) -> Result<Vec<i64>> {
    table
        .column(idx)
        .enumerate()
        .map(|(row, v)| v.as_i64().ok_or_else(|| invalid(table, idx, row, v)))
        .collect()
}

fn invalid(table: &Table, idx: usize, row: usize, v: &Value) -> PipelineError {
    PipelineError::InvalidValue {
        column: table.columns[idx].clone(),
        row,
        value: if v.is_null() {
            "<missing>".to_string()
        } else {
            v.to_string()
        },
    }
}
