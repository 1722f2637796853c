//! Time-windowed statistics over the emission value.

use log::{info, warn};

use super::numeric_column;
use crate::data::model::{Table, Value};
use crate::data::schema::Schema;
use crate::error::{PipelineError, Result};

pub const ROLLING_MEAN_COLUMN: &str = "rolling_mean_7";
pub const PCT_CHANGE_COLUMN: &str = "pct_change";

/// Trailing window length, current row included.
pub const ROLLING_WINDOW: usize = 7;

/// Result of [`build_features`].
#[derive(Debug, Clone)]
pub struct FeatureOutcome {
    pub table: Table,
    /// Rows removed because a derived value was not finite.
    pub dropped: usize,
}

/// Mean over the current value and up to `window - 1` preceding values.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    (0..values.len())
        .map(|i| {
            let lo = (i + 1).saturating_sub(window);
            let slice = &values[lo..=i];
            slice.iter().sum::<f64>() / slice.len() as f64
        })
        .collect()
}

/// Fractional change from the preceding value; the first entry is 0.
///
/// A zero predecessor yields an infinity (or NaN for 0 → 0); callers drop
/// such rows.
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    for (i, &v) in values.iter().enumerate() {
        if i == 0 {
            out.push(0.0);
        } else {
            let prev = values[i - 1];
            out.push((v - prev) / prev);
        }
    }
    out
}

/// Append `rolling_mean_7` and `pct_change` to a cleaned table.
///
/// Both are computed over the full cleaned sequence first; rows whose
/// derived values are not finite are dropped afterwards.
pub fn build_features(mut table: Table) -> Result<FeatureOutcome> {
    let schema = Schema::resolve(&table)?;
    let values = numeric_column(&table, schema.emission_value.index)?;

    let rolling = rolling_mean(&values, ROLLING_WINDOW);
    let change = pct_change(&values);

    let before = table.len();
    table.set_column(ROLLING_MEAN_COLUMN, rolling.iter().map(|&v| Value::finite(v)).collect());
    table.set_column(PCT_CHANGE_COLUMN, change.iter().map(|&v| Value::finite(v)).collect());

    table.retain_indices(|i| rolling[i].is_finite() && change[i].is_finite());
    let dropped = before - table.len();
    if dropped > 0 {
        warn!("dropped {dropped} rows with non-finite derived features");
    }

    if table.is_empty() {
        return Err(PipelineError::EmptyResult {
            stage: "features".to_string(),
            before,
            after: 0,
        });
    }
    info!("built features for {} rows", table.len());

    Ok(FeatureOutcome { table, dropped })
}
