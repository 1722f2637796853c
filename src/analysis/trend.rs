//! Linear emission trend and deviation flagging.
//!
//! The model is fit by ordinary least squares on a seeded 80/20 split and
//! then applied to every row; rows whose actual value departs from the
//! prediction by more than the configured percentage are flagged.

use std::fmt;
use std::str::FromStr;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::features::{PCT_CHANGE_COLUMN, ROLLING_MEAN_COLUMN};
use super::{integer_column, numeric_column};
use crate::config::TrendConfig;
use crate::data::model::{Table, Value};
use crate::data::schema::{require_column, Schema};
use crate::error::{PipelineError, Result};

pub const PREDICTED_COLUMN: &str = "predicted_value";
pub const DEVIATION_COLUMN: &str = "deviation_pct";
pub const FLAGGED_COLUMN: &str = "flagged";

/// Explanatory variables of the trend regression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrendInputs {
    /// Zero-based year index only.
    #[default]
    Year,
    /// Year index plus `rolling_mean_7` and `pct_change`.
    YearFeatures,
}

impl FromStr for TrendInputs {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "year" => Ok(TrendInputs::Year),
            "year-features" => Ok(TrendInputs::YearFeatures),
            other => Err(format!("unknown trend inputs '{other}'")),
        }
    }
}

impl fmt::Display for TrendInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrendInputs::Year => "year",
            TrendInputs::YearFeatures => "year-features",
        })
    }
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Row indices of the training and held-out partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainTestSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Seeded shuffle of `0..n`; the first `ceil(test_fraction · n)` indices
/// of the permutation are held out.
pub fn train_test_split(n: usize, test_fraction: f64, seed: u64) -> TrainTestSplit {
    let n_test = (test_fraction * n as f64).ceil().max(0.0) as usize;
    let n_test = n_test.min(n);

    let mut perm: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    perm.shuffle(&mut rng);

    let train = perm.split_off(n_test);
    TrainTestSplit { train, test: perm }
}

// ---------------------------------------------------------------------------
// Least squares
// ---------------------------------------------------------------------------

/// Fitted intercept and slopes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OlsFit {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

/// Ordinary least squares with an intercept.
///
/// Solves the normal equations of the mean-centred design, which keeps
/// year-sized regressors well conditioned.
pub(crate) fn ols(x: &[Vec<f64>], y: &[f64]) -> Result<OlsFit> {
    let n = y.len();
    if n == 0 || x.len() != n {
        return Err(PipelineError::ModelFit("no observations to fit".to_string()));
    }
    let p = x[0].len();

    let x_mean: Vec<f64> = (0..p)
        .map(|j| x.iter().map(|row| row[j]).sum::<f64>() / n as f64)
        .collect();
    let y_mean = y.iter().sum::<f64>() / n as f64;

    // [XᵀX | Xᵀy] on centred data
    let mut a = vec![vec![0.0; p + 1]; p];
    for (row, &yi) in x.iter().zip(y) {
        let yc = yi - y_mean;
        for j in 0..p {
            let xj = row[j] - x_mean[j];
            for k in 0..p {
                a[j][k] += xj * (row[k] - x_mean[k]);
            }
            a[j][p] += xj * yc;
        }
    }

    let coefficients = solve(a)?;
    let intercept = y_mean
        - coefficients
            .iter()
            .zip(&x_mean)
            .map(|(b, m)| b * m)
            .sum::<f64>();

    Ok(OlsFit {
        intercept,
        coefficients,
    })
}

/// Gaussian elimination with partial pivoting on an augmented matrix.
fn solve(mut a: Vec<Vec<f64>>) -> Result<Vec<f64>> {
    let p = a.len();
    let scale = (0..p).map(|i| a[i][i].abs()).fold(0.0, f64::max);
    let tol = scale.max(1.0) * 1e-12;

    for col in 0..p {
        let pivot = (col..p)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() <= tol {
            return Err(PipelineError::ModelFit(
                "design matrix is singular; a regressor has no variation".to_string(),
            ));
        }
        a.swap(col, pivot);
        for row in col + 1..p {
            let factor = a[row][col] / a[col][col];
            for k in col..=p {
                a[row][k] -= factor * a[col][k];
            }
        }
    }

    let mut beta = vec![0.0; p];
    for col in (0..p).rev() {
        let tail: f64 = (col + 1..p).map(|k| a[col][k] * beta[k]).sum();
        beta[col] = (a[col][p] - tail) / a[col][col];
    }
    Ok(beta)
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// The fitted trend, persisted alongside the flagged table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendModel {
    pub inputs: TrendInputs,
    /// Year mapped to index 0.
    pub base_year: i64,
    pub intercept: f64,
    /// One slope per regressor, year index first.
    pub coefficients: Vec<f64>,
    pub train_rows: usize,
    pub test_rows: usize,
    pub rmse: Option<f64>,
    pub r2: Option<f64>,
}

impl TrendModel {
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(x)
                .map(|(b, v)| b * v)
                .sum::<f64>()
    }
}

/// `(actual - predicted) / predicted · 100`, or `None` when undefined.
pub fn deviation_pct(actual: f64, predicted: f64) -> Option<f64> {
    if predicted == 0.0 {
        return None;
    }
    let dev = (actual - predicted) / predicted * 100.0;
    dev.is_finite().then_some(dev)
}

/// Strictly above the threshold; an undefined deviation is never flagged.
pub fn is_flagged(deviation: Option<f64>, threshold: f64) -> bool {
    deviation.is_some_and(|d| d.abs() > threshold)
}

/// Result of [`apply_trend`].
#[derive(Debug, Clone)]
pub struct TrendOutcome {
    pub table: Table,
    pub model: TrendModel,
    pub flagged: usize,
}

/// Fit the trend on the training partition, predict every row and append
/// `predicted_value`, `deviation_pct` and `flagged`.
pub fn apply_trend(mut table: Table, cfg: &TrendConfig) -> Result<TrendOutcome> {
    let schema = Schema::resolve(&table)?;
    let years = integer_column(&table, schema.reporting_year.index)?;
    let actual = numeric_column(&table, schema.emission_value.index)?;
    let n = actual.len();

    let base_year = years.iter().copied().min().ok_or_else(|| {
        PipelineError::ModelFit("trend model needs at least one row".to_string())
    })?;

    let extra = match cfg.inputs {
        TrendInputs::Year => Vec::new(),
        TrendInputs::YearFeatures => vec![
            numeric_column(&table, require_column(&table, ROLLING_MEAN_COLUMN)?)?,
            numeric_column(&table, require_column(&table, PCT_CHANGE_COLUMN)?)?,
        ],
    };
    let design: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            let mut row = vec![(years[i] - base_year) as f64];
            row.extend(extra.iter().map(|col| col[i]));
            row
        })
        .collect();

    let split = train_test_split(n, cfg.test_fraction, cfg.seed);
    let mut train_years: Vec<i64> = split.train.iter().map(|&i| years[i]).collect();
    train_years.sort_unstable();
    train_years.dedup();
    if train_years.len() < 2 {
        return Err(PipelineError::ModelFit(format!(
            "training partition spans {} distinct year(s); at least 2 are required",
            train_years.len()
        )));
    }

    let x_train: Vec<Vec<f64>> = split.train.iter().map(|&i| design[i].clone()).collect();
    let y_train: Vec<f64> = split.train.iter().map(|&i| actual[i]).collect();
    let fit = ols(&x_train, &y_train)?;

    let mut model = TrendModel {
        inputs: cfg.inputs,
        base_year,
        intercept: fit.intercept,
        coefficients: fit.coefficients,
        train_rows: split.train.len(),
        test_rows: split.test.len(),
        rmse: None,
        r2: None,
    };

    let predicted: Vec<f64> = design.iter().map(|x| model.predict(x)).collect();
    let (rmse, r2) = held_out_metrics(&split.test, &actual, &predicted);
    model.rmse = rmse;
    model.r2 = r2;
    match (rmse, r2) {
        (Some(rmse), Some(r2)) => info!("trend model RMSE: {rmse:.2}, R²: {r2:.3}"),
        (Some(rmse), None) => info!("trend model RMSE: {rmse:.2}, R² undefined"),
        _ => info!("trend model has no held-out rows"),
    }

    let deviations: Vec<Option<f64>> = actual
        .iter()
        .zip(&predicted)
        .map(|(&a, &p)| deviation_pct(a, p))
        .collect();
    let undefined = deviations.iter().filter(|d| d.is_none()).count();
    if undefined > 0 {
        warn!("{undefined} rows have an undefined deviation (zero prediction)");
    }
    let flags: Vec<bool> = deviations
        .iter()
        .map(|&d| is_flagged(d, cfg.threshold))
        .collect();
    let flagged = flags.iter().filter(|&&f| f).count();

    table.set_column(PREDICTED_COLUMN, predicted.into_iter().map(Value::finite).collect());
    table.set_column(
        DEVIATION_COLUMN,
        deviations
            .into_iter()
            .map(|d| d.map_or(Value::Null, Value::Float))
            .collect(),
    );
    table.set_column(FLAGGED_COLUMN, flags.into_iter().map(Value::Bool).collect());
    info!("flagged {flagged} of {n} rows (threshold ±{}%)", cfg.threshold);

    Ok(TrendOutcome {
        table,
        model,
        flagged,
    })
}

fn held_out_metrics(test: &[usize], actual: &[f64], predicted: &[f64]) -> (Option<f64>, Option<f64>) {
    if test.is_empty() {
        return (None, None);
    }
    let m = test.len() as f64;
    let ss_res: f64 = test
        .iter()
        .map(|&i| (actual[i] - predicted[i]).powi(2))
        .sum();
    let rmse = (ss_res / m).sqrt();

    if test.len() < 2 {
        return (Some(rmse), None);
    }
    let mean = test.iter().map(|&i| actual[i]).sum::<f64>() / m;
    let ss_tot: f64 = test.iter().map(|&i| (actual[i] - mean).powi(2)).sum();
    let r2 = (ss_tot > 0.0).then(|| 1.0 - ss_res / ss_tot);
    (Some(rmse), r2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_table(values: &[f64]) -> Table {
        Table::new(
            vec!["reporting_year".into(), "emission_value".into()],
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| vec![Value::Integer(2015 + i as i64), Value::Float(v)])
                .collect(),
        )
    }

    #[test]
    fn split_is_deterministic_and_partitions_rows() {
        let a = train_test_split(10, 0.2, 42);
        let b = train_test_split(10, 0.2, 42);
        assert_eq!(a, b);
        assert_eq!(a.test.len(), 2);
        assert_eq!(a.train.len(), 8);

        let mut all: Vec<usize> = a.train.iter().chain(&a.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn split_rounds_held_out_count_up() {
        assert_eq!(train_test_split(11, 0.2, 42).test.len(), 3);
        assert_eq!(train_test_split(5, 0.2, 42).test.len(), 1);
        assert_eq!(train_test_split(12, 0.2, 42).test.len(), 3);
        assert_eq!(train_test_split(30, 0.1, 42).test.len(), 3);
    }

    #[test]
    fn ols_recovers_exact_line() {
        let x: Vec<Vec<f64>> = (0..6).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..6).map(|i| 3.0 + 2.0 * i as f64).collect();
        let fit = ols(&x, &y).unwrap();
        assert!((fit.intercept - 3.0).abs() < 1e-9);
        assert!((fit.coefficients[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn ols_handles_two_regressors() {
        let x: Vec<Vec<f64>> = (0..8)
            .map(|i| vec![i as f64, ((i * i) % 5) as f64])
            .collect();
        let y: Vec<f64> = x.iter().map(|r| 1.0 + 0.5 * r[0] - 4.0 * r[1]).collect();
        let fit = ols(&x, &y).unwrap();
        assert!((fit.intercept - 1.0).abs() < 1e-8);
        assert!((fit.coefficients[0] - 0.5).abs() < 1e-8);
        assert!((fit.coefficients[1] + 4.0).abs() < 1e-8);
    }

    #[test]
    fn ols_rejects_constant_regressor() {
        let x = vec![vec![1.0], vec![1.0], vec![1.0]];
        assert!(matches!(
            ols(&x, &[1.0, 2.0, 3.0]),
            Err(PipelineError::ModelFit(_))
        ));
    }

    #[test]
    fn flag_threshold_is_strict() {
        assert!(!is_flagged(Some(15.0), 15.0));
        assert!(is_flagged(Some(15.0001), 15.0));
        assert!(is_flagged(Some(-15.0001), 15.0));
        assert!(!is_flagged(None, 0.0));
    }

    #[test]
    fn zero_prediction_is_undefined() {
        assert_eq!(deviation_pct(10.0, 0.0), None);
        assert_eq!(deviation_pct(0.0, 0.0), None);
        assert_eq!(deviation_pct(115.0, 100.0), Some(15.0));
    }

    #[test]
    fn outlier_in_held_out_rows_is_the_only_flag() {
        let split = train_test_split(10, 0.2, 42);
        let mut values = vec![100.0; 10];
        values[split.test[0]] = 500.0;

        let out = apply_trend(feature_table(&values), &TrendConfig::default()).unwrap();
        assert_eq!(out.flagged, 1);
        assert_eq!(out.model.base_year, 2015);
        assert_eq!(out.model.coefficients, vec![0.0]);
        assert_eq!(out.model.intercept, 100.0);

        let flag = out.table.column_index(FLAGGED_COLUMN).unwrap();
        for (i, v) in out.table.column(flag).enumerate() {
            assert_eq!(v.as_bool(), Some(i == split.test[0]), "row {i}");
        }
        let dev = out.table.column_index(DEVIATION_COLUMN).unwrap();
        assert_eq!(out.table.rows[split.test[0]][dev], Value::Float(400.0));
    }

    #[test]
    fn single_training_year_cannot_be_fit() {
        let mut table = feature_table(&[1.0, 2.0, 3.0]);
        for row in &mut table.rows {
            row[0] = Value::Integer(2020);
        }
        assert!(matches!(
            apply_trend(table, &TrendConfig::default()),
            Err(PipelineError::ModelFit(_))
        ));
    }

    #[test]
    fn fractional_year_is_invalid() {
        let mut table = feature_table(&[1.0, 2.0, 3.0]);
        table.rows[1][0] = Value::Float(2016.5);
        assert!(matches!(
            apply_trend(table, &TrendConfig::default()),
            Err(PipelineError::InvalidValue { .. })
        ));
    }

    #[test]
    fn feature_inputs_require_feature_columns() {
        let cfg = TrendConfig {
            inputs: TrendInputs::YearFeatures,
            ..TrendConfig::default()
        };
        match apply_trend(feature_table(&[1.0, 2.0, 3.0, 4.0, 5.0]), &cfg) {
            Err(PipelineError::Schema { field, .. }) => assert_eq!(field, ROLLING_MEAN_COLUMN),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn feature_inputs_recover_all_three_slopes() {
        let rows = (0..10)
            .map(|i| {
                let rolling = ((i * i) % 7) as f64;
                let change = ((3 * i) % 5) as f64 * 0.25;
                let value = 5.0 + 2.0 * i as f64 + 0.5 * rolling + 10.0 * change;
                vec![
                    Value::Integer(2015 + i as i64),
                    Value::Float(value),
                    Value::Float(rolling),
                    Value::Float(change),
                ]
            })
            .collect();
        let table = Table::new(
            vec![
                "reporting_year".into(),
                "emission_value".into(),
                ROLLING_MEAN_COLUMN.into(),
                PCT_CHANGE_COLUMN.into(),
            ],
            rows,
        );
        let cfg = TrendConfig {
            inputs: TrendInputs::YearFeatures,
            ..TrendConfig::default()
        };

        let out = apply_trend(table, &cfg).unwrap();
        assert_eq!(out.model.inputs, TrendInputs::YearFeatures);
        assert_eq!(out.model.coefficients.len(), 3);
        for (got, want) in out.model.coefficients.iter().zip([2.0, 0.5, 10.0]) {
            assert!((got - want).abs() < 1e-8, "{got} vs {want}");
        }
        assert!((out.model.intercept - 5.0).abs() < 1e-8);
        assert_eq!(out.flagged, 0);
        assert!(out.model.rmse.unwrap() < 1e-8);
    }

    #[test]
    fn model_serializes_to_json() {
        let out = apply_trend(
            feature_table(&[10.0, 12.0, 14.0, 16.0, 18.0, 20.0]),
            &TrendConfig::default(),
        )
        .unwrap();
        let json = serde_json::to_string(&out.model).unwrap();
        let back: TrendModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.inputs, TrendInputs::Year);
        assert!((back.coefficients[0] - 2.0).abs() < 1e-9);
        assert_eq!(out.flagged, 0);
    }
}
