//! Stage orchestration.
//!
//! Stages run strictly in order and hand data to each other only through
//! persisted artifacts: every stage after `clean` resolves its input with
//! [`ArtifactStore::resolve_read`] and writes its output before the next
//! stage starts. A failing stage aborts the rest of the run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use log::info;
use serde::{Deserialize, Serialize};

use crate::analysis::anomaly::{detect_anomalies, ANOMALY_COLUMN};
use crate::analysis::clean::clean;
use crate::analysis::features::build_features;
use crate::analysis::trend::{apply_trend, TrendModel, FLAGGED_COLUMN};
use crate::analysis::yearly::yearly_alerts;
use crate::artifacts::{Artifact, ArtifactStore};
use crate::config::PipelineConfig;
use crate::data::loader::{read_table, write_table, write_text, ReadOptions};
use crate::data::model::Table;
use crate::data::schema::require_column;
use crate::error::{PipelineError, Result};
use crate::report::compliance::{compliance_summary, flagged_examples, ComplianceFacts, EXAMPLE_LIMIT};
use crate::report::summary::{anomaly_details, SummaryAssembler, SummaryGenerator, SummaryRequest};

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Clean,
    Features,
    Trend,
    Anomaly,
    Alerts,
    Summary,
}

impl Stage {
    /// Execution order of a full run.
    pub const ALL: [Stage; 6] = [
        Stage::Clean,
        Stage::Features,
        Stage::Trend,
        Stage::Anomaly,
        Stage::Alerts,
        Stage::Summary,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Clean => "clean",
            Stage::Features => "features",
            Stage::Trend => "trend",
            Stage::Anomaly => "anomaly",
            Stage::Alerts => "alerts",
            Stage::Summary => "summary",
        }
    }

    /// The artifact this stage reads; `None` for the raw-input stage.
    pub fn input(self) -> Option<Artifact> {
        match self {
            Stage::Clean => None,
            Stage::Features => Some(Artifact::Cleaned),
            Stage::Trend => Some(Artifact::Features),
            Stage::Anomaly | Stage::Alerts => Some(Artifact::Flagged),
            Stage::Summary => Some(Artifact::Anomalies),
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one stage read, wrote and counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub input: Option<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub rows_in: usize,
    pub rows_out: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flagged: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomalies: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_model: Option<TrendModel>,
    pub elapsed_ms: u64,
}

impl StageReport {
    fn new(stage: Stage, input: Option<PathBuf>, rows_in: usize) -> Self {
        StageReport {
            stage,
            input,
            outputs: Vec::new(),
            rows_in,
            rows_out: 0,
            flagged: None,
            anomalies: None,
            alerts: None,
            trend_model: None,
            elapsed_ms: 0,
        }
    }
}

/// Record of a complete run, persisted as the `run_report` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub submission_id: Option<String>,
    pub stages: Vec<StageReport>,
    pub flagged: usize,
    pub anomalies: usize,
    pub yearly_alerts: usize,
    pub rmse: Option<f64>,
    pub r2: Option<f64>,
    pub duration_secs: f64,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the stages of one submission against its artifact store.
pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
    summaries: SummaryAssembler,
    started: Instant,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = ArtifactStore::from_config(&config.artifacts, config.submission_id.clone());
        Ok(Pipeline {
            config,
            store,
            summaries: SummaryAssembler::new(),
            started: Instant::now(),
        })
    }

    /// Use an external generator for narrative text, with the template as
    /// fallback.
    pub fn with_generator(mut self, generator: Box<dyn SummaryGenerator>) -> Self {
        self.summaries = SummaryAssembler::with_generator(generator);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run every stage in order and persist the run report.
    pub fn run(&self) -> Result<RunReport> {
        let id = self
            .store
            .submission()
            .map_or_else(|| "<none>".to_string(), |s| s.to_string());
        info!("starting run for submission {id}");

        let mut stages = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            stages.push(self.run_stage(stage)?);
        }

        let model = stages.iter().find_map(|s| s.trend_model.as_ref());
        let report = RunReport {
            submission_id: self.store.submission().map(|s| s.to_string()),
            flagged: first_count(&stages, |s| s.flagged),
            anomalies: first_count(&stages, |s| s.anomalies),
            yearly_alerts: first_count(&stages, |s| s.alerts),
            rmse: model.and_then(|m| m.rmse),
            r2: model.and_then(|m| m.r2),
            duration_secs: self.started.elapsed().as_secs_f64(),
            stages,
        };

        let path = self.store.write_path(Artifact::RunReport);
        write_text(&path, &serde_json::to_string_pretty(&report)?)?;
        info!(
            "run for submission {id} finished in {:.2}s: {} flagged, {} anomalies; report at {}",
            report.duration_secs,
            report.flagged,
            report.anomalies,
            path.display()
        );
        Ok(report)
    }

    /// Path `stage` would read its input from, or the error it would fail with.
    pub fn resolve_input(&self, stage: Stage) -> Result<PathBuf> {
        match stage.input() {
            Some(artifact) => self.store.resolve_read(artifact, stage.name()),
            None => self.raw_input().map(PathBuf::from),
        }
    }

    /// Run a single stage against whatever its input artifact currently holds.
    pub fn run_stage(&self, stage: Stage) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = match stage {
            Stage::Clean => self.clean_stage()?,
            Stage::Features => self.features_stage()?,
            Stage::Trend => self.trend_stage()?,
            Stage::Anomaly => self.anomaly_stage()?,
            Stage::Alerts => self.alerts_stage()?,
            Stage::Summary => self.summary_stage()?,
        };
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "[{stage}] {} rows in, {} rows out, {} ms",
            report.rows_in, report.rows_out, report.elapsed_ms
        );
        Ok(report)
    }

    fn raw_input(&self) -> Result<&Path> {
        self.config.input.path.as_deref().ok_or_else(|| {
            PipelineError::InvalidConfig("no input table given for the clean stage".to_string())
        })
    }

    fn read_input(&self, stage: Stage) -> Result<(PathBuf, Table)> {
        let path = self.resolve_input(stage)?;
        info!("[{stage}] reading {}", path.display());
        let table = read_table(&path, &ReadOptions::default())?;
        Ok((path, table))
    }

    fn write(&self, report: &mut StageReport, artifact: Artifact, table: &Table) -> Result<()> {
        let path = self.store.write_path(artifact);
        write_table(&path, table)?;
        info!("[{}] wrote {} rows to {}", report.stage, table.len(), path.display());
        report.outputs.push(path);
        Ok(())
    }

    fn write_str(&self, report: &mut StageReport, artifact: Artifact, text: &str) -> Result<()> {
        let path = self.store.write_path(artifact);
        write_text(&path, text)?;
        info!("[{}] wrote {}", report.stage, path.display());
        report.outputs.push(path);
        Ok(())
    }

    fn clean_stage(&self) -> Result<StageReport> {
        let path = self.raw_input()?.to_path_buf();
        info!("[clean] reading {}", path.display());
        let raw = read_table(&path, &self.config.input.read_options())?;

        let mut report = StageReport::new(Stage::Clean, Some(path), raw.len());
        let outcome = clean(raw)?;
        report.rows_out = outcome.rows_after;
        self.write(&mut report, Artifact::Cleaned, &outcome.table)?;
        Ok(report)
    }

    fn features_stage(&self) -> Result<StageReport> {
        let (path, table) = self.read_input(Stage::Features)?;
        let mut report = StageReport::new(Stage::Features, Some(path), table.len());
        let outcome = build_features(table)?;
        report.rows_out = outcome.table.len();
        self.write(&mut report, Artifact::Features, &outcome.table)?;
        Ok(report)
    }

    fn trend_stage(&self) -> Result<StageReport> {
        let (path, table) = self.read_input(Stage::Trend)?;
        let mut report = StageReport::new(Stage::Trend, Some(path), table.len());
        let outcome = apply_trend(table, &self.config.trend)?;
        report.rows_out = outcome.table.len();
        report.flagged = Some(outcome.flagged);
        self.write(&mut report, Artifact::Flagged, &outcome.table)?;

        let model_json = serde_json::to_string_pretty(&outcome.model)?;
        self.write_str(&mut report, Artifact::TrendModel, &model_json)?;
        report.trend_model = Some(outcome.model);
        Ok(report)
    }

    fn anomaly_stage(&self) -> Result<StageReport> {
        let (path, table) = self.read_input(Stage::Anomaly)?;
        let mut report = StageReport::new(Stage::Anomaly, Some(path), table.len());
        let outcome = detect_anomalies(table, &self.config.anomaly)?;
        report.rows_out = outcome.table.len();
        report.anomalies = Some(outcome.anomalies);
        self.write(&mut report, Artifact::Anomalies, &outcome.table)?;
        Ok(report)
    }

    fn alerts_stage(&self) -> Result<StageReport> {
        let (path, table) = self.read_input(Stage::Alerts)?;
        let mut report = StageReport::new(Stage::Alerts, Some(path), table.len());
        let outcome = yearly_alerts(&table)?;
        report.rows_out = outcome.table.len();
        report.alerts = Some(outcome.table.len());
        self.write(&mut report, Artifact::Alerts, &outcome.table)?;
        self.write_str(&mut report, Artifact::AlertSummary, &outcome.summary)?;
        Ok(report)
    }

    fn summary_stage(&self) -> Result<StageReport> {
        let (path, table) = self.read_input(Stage::Summary)?;
        let mut report = StageReport::new(Stage::Summary, Some(path), table.len());

        let flagged = count_true(&table, FLAGGED_COLUMN)?;
        let anomalies = count_true(&table, ANOMALY_COLUMN)?;
        let request = SummaryRequest::new(
            table.len(),
            anomalies,
            self.started.elapsed().as_secs_f64(),
            anomaly_details(&table)?,
        );
        let narrative = self.summaries.assemble(&request);

        let facts = ComplianceFacts {
            total: table.len(),
            flagged,
            anomalies,
            threshold: self.config.trend.threshold,
            examples: flagged_examples(&table, EXAMPLE_LIMIT)?,
        };
        let text = compliance_summary(&facts, &narrative);

        report.rows_out = table.len();
        report.flagged = Some(flagged);
        report.anomalies = Some(anomalies);
        self.write_str(&mut report, Artifact::Summary, &text)?;
        Ok(report)
    }
}

fn first_count(stages: &[StageReport], pick: impl Fn(&StageReport) -> Option<usize>) -> usize {
    stages.iter().find_map(pick).unwrap_or(0)
}

fn count_true(table: &Table, column: &str) -> Result<usize> {
    let idx = require_column(table, column)?;
    Ok(table
        .column(idx)
        .filter(|v| v.as_bool() == Some(true))
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!("report".parse::<Stage>().is_err());
    }

    #[test]
    fn stages_read_their_predecessor() {
        assert_eq!(Stage::Clean.input(), None);
        assert_eq!(Stage::Trend.input(), Some(Artifact::Features));
        assert_eq!(Stage::Alerts.input(), Some(Artifact::Flagged));
        assert_eq!(Stage::Summary.input(), Some(Artifact::Anomalies));
    }

    #[test]
    fn clean_without_input_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.artifacts.root = dir.path().to_path_buf();
        let pipeline = Pipeline::new(config).unwrap();
        assert!(matches!(
            pipeline.run_stage(Stage::Clean),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = PipelineConfig::default();
        config.trend.test_fraction = 0.0;
        assert!(Pipeline::new(config).is_err());
    }
}
