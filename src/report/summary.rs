//! Narrative summaries of a run.
//!
//! A [`SummaryGenerator`] may be backed by an external text service; the
//! [`SummaryAssembler`] always has the deterministic [`TemplateSummary`] to
//! fall back on, so a summary failure never fails the run.

use std::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::anomaly::ANOMALY_COLUMN;
use crate::analysis::trend::DEVIATION_COLUMN;
use crate::analysis::{integer_column, numeric_column};
use crate::data::model::Table;
use crate::data::schema::{require_column, Schema};
use crate::error::Result;

/// Anomaly details carried in a request.
pub const MAX_DETAILS: usize = 5;

const HIGH_DEVIATION: f64 = 30.0;
const MEDIUM_DEVIATION: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Grade by absolute deviation; an undefined deviation is `Low`.
    pub fn from_deviation(deviation: Option<f64>) -> Severity {
        match deviation.map(f64::abs) {
            Some(d) if d >= HIGH_DEVIATION => Severity::High,
            Some(d) if d >= MEDIUM_DEVIATION => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetail {
    pub facility: String,
    pub year: i64,
    pub emission_value: f64,
    pub severity: Severity,
}

/// Input to a summary generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub total_records: usize,
    pub anomalies_found: usize,
    /// Seconds spent in the pipeline so far.
    pub processing_time: f64,
    /// At most [`MAX_DETAILS`] entries.
    pub anomalies: Vec<AnomalyDetail>,
    /// Details dropped by the bound.
    pub omitted: usize,
}

impl SummaryRequest {
    pub fn new(
        total_records: usize,
        anomalies_found: usize,
        processing_time: f64,
        mut anomalies: Vec<AnomalyDetail>,
    ) -> Self {
        let omitted = anomalies.len().saturating_sub(MAX_DETAILS);
        anomalies.truncate(MAX_DETAILS);
        SummaryRequest {
            total_records,
            anomalies_found,
            processing_time,
            anomalies,
            omitted,
        }
    }

    /// Anomalies as a percentage of all records.
    pub fn anomaly_rate(&self) -> f64 {
        if self.total_records == 0 {
            0.0
        } else {
            self.anomalies_found as f64 / self.total_records as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryText {
    /// One or two sentences for a dashboard card.
    pub short: String,
    /// Sectioned report text.
    pub long: String,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("summary service unavailable: {0}")]
    Unavailable(String),

    #[error("summary service returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Produces narrative text for a run.
pub trait SummaryGenerator {
    fn name(&self) -> &str;

    fn generate(&self, request: &SummaryRequest) -> std::result::Result<SummaryText, GeneratorError>;
}

/// Deterministic template text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateSummary;

impl SummaryGenerator for TemplateSummary {
    fn name(&self) -> &str {
        "template"
    }

    fn generate(&self, req: &SummaryRequest) -> std::result::Result<SummaryText, GeneratorError> {
        Ok(self.render(req))
    }
}

impl TemplateSummary {
    pub fn render(&self, req: &SummaryRequest) -> SummaryText {
        SummaryText {
            short: short_text(req),
            long: long_text(req),
        }
    }
}

fn short_text(req: &SummaryRequest) -> String {
    format!(
        "Analysis completed for {} records. {} anomalies detected ({:.2}%).",
        group_thousands(req.total_records),
        req.anomalies_found,
        req.anomaly_rate()
    )
}

fn long_text(req: &SummaryRequest) -> String {
    let rate = req.anomaly_rate();
    let mut out = String::from("# Emissions Analysis Summary\n\n## Executive Summary\n");
    out.push_str(&format!(
        "Analysis completed for {} records with {} anomalies detected ({rate:.2}% anomaly rate). \
         Processing completed in {:.2} seconds.\n\n",
        group_thousands(req.total_records),
        req.anomalies_found,
        req.processing_time
    ));

    out.push_str("## Key Findings\n");
    if req.anomalies_found == 0 {
        out.push_str("- No anomalies detected\n");
    } else {
        out.push_str(&format!("- {} anomalies requiring attention\n", req.anomalies_found));
    }
    out.push_str(if rate < 1.0 {
        "- Emissions within expected parameters\n"
    } else if rate < 5.0 {
        "- Reporting irregularities identified\n"
    } else {
        "- Significant emission irregularities detected\n"
    });

    if !req.anomalies.is_empty() {
        out.push_str("\n## Anomaly Details\n");
        for (i, a) in req.anomalies.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} ({}) - {:.2} units ({} severity)\n",
                i + 1,
                a.facility,
                a.year,
                a.emission_value,
                a.severity
            ));
        }
        if req.omitted > 0 {
            out.push_str(&format!("... and {} additional anomalies\n", req.omitted));
        }
    }

    out.push_str("\n## Recommendations\n");
    out.push_str(if req.anomalies_found == 0 {
        "- Continue current monitoring practices\n"
    } else {
        "- Investigate detected anomalies immediately\n"
    });
    out.push_str("- Document findings for compliance reporting\n");
    out.push_str("- Schedule follow-up analysis within 30 days\n");
    out
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Wraps an optional external generator with the template fallback.
#[derive(Default)]
pub struct SummaryAssembler {
    generator: Option<Box<dyn SummaryGenerator>>,
}

impl SummaryAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generator(generator: Box<dyn SummaryGenerator>) -> Self {
        SummaryAssembler {
            generator: Some(generator),
        }
    }

    /// Generator text when it succeeds, template text otherwise.
    pub fn assemble(&self, request: &SummaryRequest) -> SummaryText {
        if let Some(generator) = &self.generator {
            match generator.generate(request) {
                Ok(text) => {
                    info!("summary produced by '{}'", generator.name());
                    return text;
                }
                Err(e) => warn!("summary generator '{}' failed, using template: {e}", generator.name()),
            }
        }
        TemplateSummary.render(request)
    }
}

/// Collect a detail entry for every row labelled anomalous, in row order.
///
/// The facility is named by `facility_name`, then `facility_id`, then
/// "Unknown". Severity comes from `deviation_pct` when present.
pub fn anomaly_details(table: &Table) -> Result<Vec<AnomalyDetail>> {
    let schema = Schema::resolve(table)?;
    let years = integer_column(table, schema.reporting_year.index)?;
    let values = numeric_column(table, schema.emission_value.index)?;
    let anomaly = require_column(table, ANOMALY_COLUMN)?;
    let deviation = table.column_index(DEVIATION_COLUMN);
    let facility = schema
        .facility_name
        .as_ref()
        .or(schema.facility_id.as_ref())
        .map(|c| c.index);

    let details = table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row[anomaly].as_bool() == Some(true))
        .map(|(i, row)| AnomalyDetail {
            facility: facility
                .map(|idx| row[idx].to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            year: years[i],
            emission_value: values[i],
            severity: Severity::from_deviation(deviation.and_then(|idx| row[idx].as_f64())),
        })
        .collect();
    Ok(details)
}
