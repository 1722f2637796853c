//! The compliance summary written at the end of a run.

use std::cmp::Ordering;

use super::summary::SummaryText;
use crate::analysis::numeric_column;
use crate::analysis::trend::{DEVIATION_COLUMN, FLAGGED_COLUMN, PREDICTED_COLUMN};
use crate::data::model::Table;
use crate::data::schema::{require_column, Schema};
use crate::error::Result;

/// Flagged rows quoted in the summary.
pub const EXAMPLE_LIMIT: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedExample {
    pub facility: String,
    pub actual: f64,
    pub predicted: f64,
    pub deviation: f64,
}

/// Counts and examples the summary is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceFacts {
    pub total: usize,
    pub flagged: usize,
    pub anomalies: usize,
    pub threshold: f64,
    pub examples: Vec<FlaggedExample>,
}

/// Flagged rows with the largest absolute deviation, ties in row order.
pub fn flagged_examples(table: &Table, limit: usize) -> Result<Vec<FlaggedExample>> {
    let schema = Schema::resolve(table)?;
    let actual = numeric_column(table, schema.emission_value.index)?;
    let predicted = numeric_column(table, require_column(table, PREDICTED_COLUMN)?)?;
    let deviation = require_column(table, DEVIATION_COLUMN)?;
    let flagged = require_column(table, FLAGGED_COLUMN)?;
    let facility = schema.facility_id.as_ref().map(|c| c.index);

    let mut examples: Vec<FlaggedExample> = table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row[flagged].as_bool() == Some(true))
        .filter_map(|(i, row)| {
            let deviation = row[deviation].as_f64()?;
            Some(FlaggedExample {
                facility: facility
                    .map(|idx| row[idx].to_string())
                    .unwrap_or_else(|| format!("#{}", i + 1)),
                actual: actual[i],
                predicted: predicted[i],
                deviation,
            })
        })
        .collect();

    examples.sort_by(|a, b| {
        b.deviation
            .abs()
            .partial_cmp(&a.deviation.abs())
            .unwrap_or(Ordering::Equal)
    });
    examples.truncate(limit);
    Ok(examples)
}

/// Render the compliance summary followed by the narrative text.
pub fn compliance_summary(facts: &ComplianceFacts, narrative: &SummaryText) -> String {
    let mut out = String::from("Compliance Summary\n\n");
    out.push_str(&format!(
        "Out of {} records, {} were flagged for emissions significantly outside the expected baseline (±{}%).\n",
        facts.total, facts.flagged, facts.threshold
    ));
    out.push_str(&format!(
        "The anomaly model labelled {} records as anomalous.\n\n",
        facts.anomalies
    ));

    if facts.examples.is_empty() {
        out.push_str("No facilities were flagged.\n\n");
    } else {
        out.push_str("Example flagged facilities:\n");
        for ex in &facts.examples {
            out.push_str(&format!(
                "- Facility {} reported {:.0} vs predicted {:.0} → deviation: {:.1}%\n",
                ex.facility, ex.actual, ex.predicted, ex.deviation
            ));
        }
        out.push('\n');
    }
    out.push_str("This summary supports audit readiness by highlighting key anomalies.\n\n");

    out.push_str(&narrative.short);
    out.push_str("\n\n");
    out.push_str(&narrative.long);
    if !narrative.long.ends_with('\n') {
        out.push('\n');
    }
    out
}
