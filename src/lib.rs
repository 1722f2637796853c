//! Per-submission emissions analytics.
//!
//! A submission's raw table is cleaned, enriched with rolling features,
//! compared against a linear trend, scored by an isolation forest and
//! summarised. Every stage persists its output under a path scoped by the
//! submission id; see [`artifacts`] and [`pipeline`].

pub mod analysis;
pub mod artifacts;
pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod report;

pub use artifacts::{Artifact, ArtifactLayout, ArtifactStore, FallbackPolicy};
pub use config::{PipelineConfig, SubmissionId};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, RunReport, Stage, StageReport};
