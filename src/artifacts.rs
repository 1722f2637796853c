//! Artifact paths per submission.
//!
//! Every stage writes to a path scoped by the submission id and reads its
//! input through [`ArtifactStore::resolve_read`]. Unscoped ("legacy") paths
//! belong to runs without a submission id; a scoped run only reads them when
//! [`FallbackPolicy::Legacy`] is configured, because two submissions that
//! both miss their scoped file would otherwise read the same stale table.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{ArtifactConfig, SubmissionId};
use crate::error::{PipelineError, Result};

/// How a submission id is folded into artifact paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactLayout {
    /// `{root}/tables/flagged_emissions_output_{id}.csv`
    #[default]
    Suffix,
    /// `{root}/{id}/tables/flagged_emissions_output.csv`
    Directory,
}

impl FromStr for ArtifactLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "suffix" => Ok(ArtifactLayout::Suffix),
            "directory" | "dir" => Ok(ArtifactLayout::Directory),
            other => Err(format!("unknown artifact layout '{other}'")),
        }
    }
}

/// Whether a scoped read may fall back to the unscoped path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    #[default]
    Disabled,
    Legacy,
}

/// The files a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Cleaned,
    Features,
    Flagged,
    Anomalies,
    Alerts,
    AlertSummary,
    Summary,
    TrendModel,
    RunReport,
}

impl Artifact {
    pub fn base_name(self) -> &'static str {
        match self {
            Artifact::Cleaned => "cleaned_emissions_by_unit",
            Artifact::Features => "features",
            Artifact::Flagged => "flagged_emissions_output",
            Artifact::Anomalies => "final_output_with_anomalies",
            Artifact::Alerts => "alerts_today",
            Artifact::AlertSummary => "weekly_summary_anomalies",
            Artifact::Summary => "weekly_summary",
            Artifact::TrendModel => "trend_model",
            Artifact::RunReport => "run_report",
        }
    }

    fn subdir(self) -> &'static str {
        match self {
            Artifact::Cleaned
            | Artifact::Features
            | Artifact::Flagged
            | Artifact::Anomalies
            | Artifact::Alerts => "tables",
            Artifact::AlertSummary | Artifact::Summary | Artifact::RunReport => "logs",
            Artifact::TrendModel => "models",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Artifact::AlertSummary | Artifact::Summary => "txt",
            Artifact::TrendModel | Artifact::RunReport => "json",
            _ => "csv",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

/// Computes write paths and read-fallback chains for one submission.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    submission: Option<SubmissionId>,
    layout: ArtifactLayout,
    fallback: FallbackPolicy,
}

impl ArtifactStore {
    pub fn new(
        root: impl Into<PathBuf>,
        submission: Option<SubmissionId>,
        layout: ArtifactLayout,
        fallback: FallbackPolicy,
    ) -> Self {
        Self {
            root: root.into(),
            submission,
            layout,
            fallback,
        }
    }

    pub fn from_config(cfg: &ArtifactConfig, submission: Option<SubmissionId>) -> Self {
        Self::new(cfg.root.clone(), submission, cfg.layout, cfg.fallback)
    }

    pub fn submission(&self) -> Option<&SubmissionId> {
        self.submission.as_ref()
    }

    /// Path this run writes `artifact` to.
    pub fn write_path(&self, artifact: Artifact) -> PathBuf {
        match &self.submission {
            Some(id) => self.scoped_path(artifact, id),
            None => self.legacy_path(artifact),
        }
    }

    /// Unscoped path used by runs without a submission id.
    pub fn legacy_path(&self, artifact: Artifact) -> PathBuf {
        self.root
            .join(artifact.subdir())
            .join(format!("{}.{}", artifact.base_name(), artifact.extension()))
    }

    fn scoped_path(&self, artifact: Artifact, id: &SubmissionId) -> PathBuf {
        match self.layout {
            ArtifactLayout::Suffix => self.root.join(artifact.subdir()).join(format!(
                "{}_{}.{}",
                artifact.base_name(),
                id,
                artifact.extension()
            )),
            ArtifactLayout::Directory => self
                .root
                .join(id.as_str())
                .join(artifact.subdir())
                .join(format!("{}.{}", artifact.base_name(), artifact.extension())),
        }
    }

    /// Paths a read of `artifact` tries, in order.
    pub fn read_candidates(&self, artifact: Artifact) -> Vec<PathBuf> {
        match (&self.submission, self.fallback) {
            (Some(id), FallbackPolicy::Legacy) => {
                vec![self.scoped_path(artifact, id), self.legacy_path(artifact)]
            }
            (Some(id), FallbackPolicy::Disabled) => vec![self.scoped_path(artifact, id)],
            (None, _) => vec![self.legacy_path(artifact)],
        }
    }

    /// Resolve the input `stage` should read, or fail naming every path tried.
    pub fn resolve_read(&self, artifact: Artifact, stage: &str) -> Result<PathBuf> {
        let candidates = self.read_candidates(artifact);
        for (i, path) in candidates.iter().enumerate() {
            if path.is_file() {
                if i > 0 {
                    warn!(
                        "[{stage}] {} not found, falling back to unscoped {}",
                        candidates[0].display(),
                        path.display()
                    );
                } else {
                    debug!("[{stage}] reading {}", path.display());
                }
                return Ok(path.clone());
            }
        }
        Err(PipelineError::MissingArtifact {
            stage: stage.to_string(),
            attempted: candidates,
        })
    }
}
