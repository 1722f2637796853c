//! Run configuration.
//!
//! One [`PipelineConfig`] is built per run (from defaults, an optional TOML
//! file and CLI overrides) and handed to every stage. Stages never consult
//! the process environment themselves.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analysis::anomaly::Contamination;
use crate::analysis::trend::TrendInputs;
use crate::artifacts::{ArtifactLayout, FallbackPolicy};
use crate::data::loader::{ReadOptions, TextEncoding};
use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Submission identifier
// ---------------------------------------------------------------------------

/// Identifier scoping every artifact of one submission.
///
/// Restricted to ASCII letters, digits, `-`, `_` and `.` so it can be used
/// verbatim in a file name or directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubmissionId(String);

impl SubmissionId {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let id = raw.trim();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if id.is_empty() || !valid_chars || id.chars().all(|c| c == '.') {
            return Err(PipelineError::InvalidConfig(format!(
                "submission id '{raw}' must be non-empty and contain only letters, digits, '-', '_' or '.'"
            )));
        }
        Ok(SubmissionId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubmissionId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        SubmissionId::new(value)
    }
}

impl From<SubmissionId> for String {
    fn from(id: SubmissionId) -> String {
        id.0
    }
}

impl FromStr for SubmissionId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        SubmissionId::new(s)
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Where the raw submission table comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Raw table to clean. Required by the clean stage only.
    pub path: Option<PathBuf>,
    pub encoding: TextEncoding,
    /// Field delimiter; derived from the file extension when unset.
    pub delimiter: Option<char>,
}

impl InputConfig {
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            encoding: self.encoding,
            delimiter: self.delimiter.map(|c| c as u8),
        }
    }
}

/// Where artifacts are written and how reads fall back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub root: PathBuf,
    pub layout: ArtifactLayout,
    pub fallback: FallbackPolicy,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("deliverables"),
            layout: ArtifactLayout::Suffix,
            fallback: FallbackPolicy::Disabled,
        }
    }
}

/// Trend regression and deviation flagging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub inputs: TrendInputs,
    /// Absolute deviation (in percent) above which a record is flagged.
    pub threshold: f64,
    /// Share of rows held out for RMSE / R² reporting.
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            inputs: TrendInputs::Year,
            threshold: 15.0,
            test_fraction: 0.2,
            seed: 42,
        }
    }
}

/// Isolation forest settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// `"auto"`, a fraction in (0, 1) or a percentage in [1, 100).
    pub contamination: String,
    pub n_estimators: usize,
    /// Upper bound on rows drawn per tree.
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            contamination: "auto".to_string(),
            n_estimators: 100,
            max_samples: 256,
            seed: 42,
        }
    }
}

impl AnomalyConfig {
    pub fn contamination(&self) -> Contamination {
        Contamination::parse(&self.contamination)
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Everything one pipeline run needs to know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub submission_id: Option<SubmissionId>,
    pub input: InputConfig,
    pub artifacts: ArtifactConfig,
    pub trend: TrendConfig,
    pub anomaly: AnomalyConfig,
}

impl PipelineConfig {
    /// Load a configuration file; missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_toml_str(&text)
            .map_err(|e| PipelineError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    /// Reject settings no stage can work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.trend.threshold.is_finite() && self.trend.threshold >= 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "deviation threshold must be a non-negative number, got {}",
                self.trend.threshold
            )));
        }
        if !(self.trend.test_fraction > 0.0 && self.trend.test_fraction < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "test fraction must lie in (0, 1), got {}",
                self.trend.test_fraction
            )));
        }
        if self.anomaly.n_estimators == 0 || self.anomaly.max_samples < 2 {
            return Err(PipelineError::InvalidConfig(
                "anomaly model needs at least one tree and max_samples >= 2".to_string(),
            ));
        }
        if let Some(d) = self.input.delimiter {
            if !d.is_ascii() {
                return Err(PipelineError::InvalidConfig(format!(
                    "delimiter must be a single ASCII character, got '{d}'"
                )));
            }
        }
        Ok(())
    }
}
