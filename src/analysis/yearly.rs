//! Year-level alerts: years whose mean emission strays from the trend of
//! yearly means.

use std::collections::BTreeMap;

use log::info;

use super::trend::ols;
use super::{integer_column, numeric_column};
use crate::data::model::{Table, Value};
use crate::data::schema::Schema;
use crate::error::{PipelineError, Result};

/// Error multiplier over the spread of yearly errors.
const SIGMA_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, PartialEq)]
pub struct YearlyPoint {
    pub year_index: i64,
    pub reporting_year: i64,
    pub mean_emission: f64,
    pub predicted: f64,
    pub error: f64,
    pub alert: bool,
}

/// Result of [`yearly_alerts`].
#[derive(Debug, Clone)]
pub struct YearlyOutcome {
    pub points: Vec<YearlyPoint>,
    pub threshold: f64,
    /// `year_index`, `mean_emission`, `reporting_year` of alerted years.
    pub table: Table,
    pub summary: String,
}

impl YearlyOutcome {
    pub fn alerts(&self) -> impl Iterator<Item = &YearlyPoint> {
        self.points.iter().filter(|p| p.alert)
    }
}

/// Average the emission per year, regress the averages on the year index
/// and alert on years whose absolute error exceeds mean + 1.5·std of all
/// errors.
pub fn yearly_alerts(table: &Table) -> Result<YearlyOutcome> {
    let schema = Schema::resolve(table)?;
    let years = integer_column(table, schema.reporting_year.index)?;
    let values = numeric_column(table, schema.emission_value.index)?;

    let mut groups: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (&year, &v) in years.iter().zip(&values) {
        let entry = groups.entry(year).or_insert((0.0, 0));
        entry.0 += v;
        entry.1 += 1;
    }
    if groups.len() < 2 {
        return Err(PipelineError::ModelFit(format!(
            "yearly trend needs at least 2 distinct years, got {}",
            groups.len()
        )));
    }
    let min_year = *groups.keys().next().unwrap_or(&0);

    let means: Vec<(i64, f64)> = groups
        .into_iter()
        .map(|(year, (sum, count))| (year, sum / count as f64))
        .collect();
    let x: Vec<Vec<f64>> = means.iter().map(|(y, _)| vec![(y - min_year) as f64]).collect();
    let y: Vec<f64> = means.iter().map(|(_, m)| *m).collect();
    let fit = ols(&x, &y)?;

    let mut points: Vec<YearlyPoint> = means
        .iter()
        .map(|&(year, mean)| {
            let year_index = year - min_year;
            let predicted = fit.intercept + fit.coefficients[0] * year_index as f64;
            YearlyPoint {
                year_index,
                reporting_year: year,
                mean_emission: mean,
                predicted,
                error: (mean - predicted).abs(),
                alert: false,
            }
        })
        .collect();

    let errors: Vec<f64> = points.iter().map(|p| p.error).collect();
    let threshold = mean(&errors) + SIGMA_FACTOR * sample_std(&errors);
    for p in &mut points {
        p.alert = p.error > threshold;
    }

    let rows = points
        .iter()
        .filter(|p| p.alert)
        .map(|p| {
            vec![
                Value::Integer(p.year_index),
                Value::Float(p.mean_emission),
                Value::Integer(p.reporting_year),
            ]
        })
        .collect();
    let table = Table::new(
        vec![
            "year_index".to_string(),
            "mean_emission".to_string(),
            "reporting_year".to_string(),
        ],
        rows,
    );

    let summary = alert_summary(&points);
    info!(
        "yearly alerts: {} of {} years above {threshold:.2}",
        table.len(),
        points.len()
    );

    Ok(YearlyOutcome {
        points,
        threshold,
        table,
        summary,
    })
}

/// Human-readable digest of the alerted years.
pub fn alert_summary(points: &[YearlyPoint]) -> String {
    let alerts: Vec<&YearlyPoint> = points.iter().filter(|p| p.alert).collect();
    match alerts.iter().max_by_key(|p| p.reporting_year) {
        None => "No anomalies detected.".to_string(),
        Some(latest) => format!(
            "{} anomaly(s) detected.\nLast anomaly: {} with {:.2}.",
            alerts.len(),
            latest.reporting_year,
            latest.mean_emission
        ),
    }
}

fn mean(v: &[f64]) -> f64 {
    v.iter().sum::<f64>() / v.len() as f64
}

fn sample_std(v: &[f64]) -> f64 {
    if v.len() < 2 {
        return 0.0;
    }
    let m = mean(v);
    (v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (v.len() - 1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[(i64, f64)]) -> Table {
        Table::new(
            vec!["reporting_year".into(), "emission_value".into()],
            rows.iter()
                .map(|&(y, v)| vec![Value::Integer(y), Value::Float(v)])
                .collect(),
        )
    }

    #[test]
    fn spike_year_raises_an_alert() {
        let mut rows: Vec<(i64, f64)> = (2010..2020).map(|y| (y, 100.0)).collect();
        rows.push((2015, 100.0));
        rows.push((2017, 900.0));
        let out = yearly_alerts(&table(&rows)).unwrap();

        let alerted: Vec<i64> = out.alerts().map(|p| p.reporting_year).collect();
        assert_eq!(alerted, vec![2017]);
        assert_eq!(out.table.len(), 1);
        assert_eq!(out.table.rows[0][0], Value::Integer(7));
        assert_eq!(out.table.rows[0][1], Value::Float(500.0));
        assert_eq!(out.summary, "1 anomaly(s) detected.\nLast anomaly: 2017 with 500.00.");
    }

    #[test]
    fn straight_line_has_no_alerts() {
        let rows: Vec<(i64, f64)> = (2000..2010).map(|y| (y, (y - 2000) as f64 * 3.0 + 1.0)).collect();
        let out = yearly_alerts(&table(&rows)).unwrap();
        assert_eq!(out.alerts().count(), 0);
        assert!(out.table.is_empty());
        assert_eq!(out.summary, "No anomalies detected.");
    }

    #[test]
    fn one_year_cannot_be_fit() {
        let out = yearly_alerts(&table(&[(2020, 1.0), (2020, 2.0)]));
        assert!(matches!(out, Err(PipelineError::ModelFit(_))));
    }

    #[test]
    fn summary_reports_latest_alert() {
        let point = |year: i64, alert: bool| YearlyPoint {
            year_index: year - 2000,
            reporting_year: year,
            mean_emission: year as f64 / 10.0,
            predicted: 0.0,
            error: 0.0,
            alert,
        };
        let points = vec![point(2003, true), point(2008, true), point(2009, false)];
        assert_eq!(
            alert_summary(&points),
            "2 anomaly(s) detected.\nLast anomaly: 2008 with 200.80."
        );
    }
}
