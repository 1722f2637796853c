//! Unsupervised anomaly labelling with an isolation forest.
//!
//! Features are standardised, then each row is scored by how quickly random
//! axis-aligned splits isolate it. Short average paths mean anomalous rows.

use std::fmt;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use super::features::{PCT_CHANGE_COLUMN, ROLLING_MEAN_COLUMN};
use super::numeric_column;
use crate::config::AnomalyConfig;
use crate::data::model::{Table, Value};
use crate::data::schema::{require_column, Schema};
use crate::error::{PipelineError, Result};

pub const SCORE_COLUMN: &str = "anomaly_score";
pub const ANOMALY_COLUMN: &str = "is_anomaly";

/// Euler–Mascheroni constant, used by the harmonic-number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Score above which a row is anomalous when no contamination is given.
const AUTO_THRESHOLD: f64 = 0.5;

/// Expected share of anomalies in the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Contamination {
    /// Label by the forest's own score threshold.
    Auto,
    /// Label roughly this fraction of rows, in (0, 1).
    Fraction(f64),
}

impl Contamination {
    /// Parse a user setting. Never fails: anything unusable means `Auto`.
    ///
    /// Values in (0, 1) are fractions, values in [1, 100) are percentages.
    pub fn parse(raw: &str) -> Contamination {
        let s = raw.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Contamination::Auto;
        }
        match s.parse::<f64>() {
            Ok(v) if v > 0.0 && v < 1.0 => Contamination::Fraction(v),
            Ok(v) if (1.0..100.0).contains(&v) => Contamination::Fraction(v / 100.0),
            _ => {
                debug!("contamination '{raw}' out of range, using auto");
                Contamination::Auto
            }
        }
    }
}

impl fmt::Display for Contamination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contamination::Auto => f.write_str("auto"),
            Contamination::Fraction(c) => write!(f, "{c}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scaling
// ---------------------------------------------------------------------------

/// Zero mean, unit population variance per feature.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> StandardScaler {
        let n = rows.len().max(1) as f64;
        let p = rows.first().map_or(0, Vec::len);
        let mean: Vec<f64> = (0..p)
            .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect();
        let scale = (0..p)
            .map(|j| {
                let var = rows.iter().map(|r| (r[j] - mean[j]).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                // constant feature
                if std > 0.0 { std } else { 1.0 }
            })
            .collect();
        StandardScaler { mean, scale }
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter()
            .map(|r| {
                r.iter()
                    .zip(self.mean.iter().zip(&self.scale))
                    .map(|(v, (m, s))| (v - m) / s)
                    .collect()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Isolation forest
// ---------------------------------------------------------------------------

/// Average unsuccessful-search path length in a binary tree of `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: usize,
        right: usize,
    },
}

/// One isolation tree stored as an arena; node 0 is the root.
#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(data: &[Vec<f64>], sample: Vec<usize>, height_limit: usize, rng: &mut StdRng) -> Self {
        let mut tree = IsolationTree { nodes: Vec::new() };
        tree.grow(data, sample, 0, height_limit, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &[Vec<f64>],
        rows: Vec<usize>,
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });
        if depth >= height_limit || rows.len() <= 1 {
            return id;
        }

        let p = data[rows[0]].len();
        let ranges: Vec<(usize, f64, f64)> = (0..p)
            .filter_map(|j| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                    (lo.min(data[r][j]), hi.max(data[r][j]))
                });
                (hi > lo).then_some((j, lo, hi))
            })
            .collect();
        if ranges.is_empty() {
            return id;
        }

        let (feature, lo, hi) = ranges[rng.gen_range(0..ranges.len())];
        let value = rng.gen_range(lo..hi);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| data[r][feature] < value);

        let left = self.grow(data, left_rows, depth + 1, height_limit, rng);
        let right = self.grow(data, right_rows, depth + 1, height_limit, rng);
        self.nodes[id] = Node::Split {
            feature,
            value,
            left,
            right,
        };
        id
    }

    fn path_length(&self, x: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    value,
                    left,
                    right,
                } => {
                    node = if x[*feature] < *value { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// An ensemble of isolation trees fit on random subsamples.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
}

impl IsolationForest {
    /// Fit `n_estimators` trees, each on `min(max_samples, n)` rows drawn
    /// without replacement.
    pub fn fit(data: &[Vec<f64>], n_estimators: usize, max_samples: usize, seed: u64) -> Result<Self> {
        let n = data.len();
        if n < 2 {
            return Err(PipelineError::ModelFit(format!(
                "anomaly model needs at least 2 rows, got {n}"
            )));
        }
        let sample_size = max_samples.min(n);
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..n_estimators)
            .map(|_| {
                let sample = index::sample(&mut rng, n, sample_size).into_vec();
                IsolationTree::build(data, sample, height_limit, &mut rng)
            })
            .collect();

        Ok(IsolationForest { trees, sample_size })
    }

    /// Anomaly score in (0, 1]; above 0.5 is anomalous.
    pub fn score(&self, x: &[f64]) -> f64 {
        let mean_path = self.trees.iter().map(|t| t.path_length(x)).sum::<f64>()
            / self.trees.len().max(1) as f64;
        2f64.powf(-mean_path / average_path_length(self.sample_size))
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Label each score according to the contamination setting.
pub fn label(scores: &[f64], contamination: Contamination) -> Vec<bool> {
    match contamination {
        Contamination::Auto => scores.iter().map(|&s| s > AUTO_THRESHOLD).collect(),
        Contamination::Fraction(c) => {
            let negated: Vec<f64> = scores.iter().map(|s| -s).collect();
            let offset = percentile(&negated, 100.0 * c);
            negated.iter().map(|&s| s < offset).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Result of [`detect_anomalies`].
#[derive(Debug, Clone)]
pub struct AnomalyOutcome {
    pub table: Table,
    pub anomalies: usize,
    pub contamination: Contamination,
}

/// Score `[emission_value, rolling_mean_7, pct_change]` and append
/// `anomaly_score` and `is_anomaly`.
pub fn detect_anomalies(mut table: Table, cfg: &AnomalyConfig) -> Result<AnomalyOutcome> {
    let schema = Schema::resolve(&table)?;
    let columns = [
        numeric_column(&table, schema.emission_value.index)?,
        numeric_column(&table, require_column(&table, ROLLING_MEAN_COLUMN)?)?,
        numeric_column(&table, require_column(&table, PCT_CHANGE_COLUMN)?)?,
    ];
    let rows: Vec<Vec<f64>> = (0..table.len())
        .map(|i| columns.iter().map(|c| c[i]).collect())
        .collect();

    let scaled = StandardScaler::fit(&rows).transform(&rows);
    let forest = IsolationForest::fit(&scaled, cfg.n_estimators, cfg.max_samples, cfg.seed)?;
    debug!(
        "isolation forest: {} trees, {} samples per tree",
        cfg.n_estimators,
        forest.sample_size()
    );

    let scores: Vec<f64> = scaled.iter().map(|x| forest.score(x)).collect();
    let contamination = cfg.contamination();
    let labels = label(&scores, contamination);
    let anomalies = labels.iter().filter(|&&a| a).count();
    info!(
        "anomalies detected: {anomalies} of {} rows (contamination {contamination})",
        table.len()
    );

    table.set_column(SCORE_COLUMN, scores.into_iter().map(Value::Float).collect());
    table.set_column(ANOMALY_COLUMN, labels.into_iter().map(Value::Bool).collect());

    Ok(AnomalyOutcome {
        table,
        anomalies,
        contamination,
    })
}
