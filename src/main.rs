use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use emission_sentinel::analysis::trend::TrendInputs;
use emission_sentinel::data::loader::TextEncoding;
use emission_sentinel::{ArtifactLayout, FallbackPolicy, Pipeline, PipelineConfig, Stage, SubmissionId};

#[derive(Parser, Debug)]
#[command(name = "emission-sentinel", version, about = "Emissions trend and anomaly pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage for one submission.
    Run(RunArgs),
    /// Run a single stage against the artifacts already on disk.
    Stage {
        stage: Stage,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Print the input path a stage would read.
    Resolve {
        stage: Stage,
        #[command(flatten)]
        args: RunArgs,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Raw submission table (.csv, .tsv, .txt or .parquet).
    #[arg(long, env = "SUBMISSION_CSV")]
    input: Option<PathBuf>,

    #[arg(long, env = "SUBMISSION_ID")]
    submission_id: Option<String>,

    /// Text encoding of a delimited input: auto, utf-8 or latin-1.
    #[arg(long)]
    encoding: Option<TextEncoding>,

    /// TOML configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// "auto", a fraction in (0, 1) or a percentage in [1, 100).
    #[arg(long, env = "ANOMALY_CONTAMINATION")]
    contamination: Option<String>,

    /// Deviation threshold in percent.
    #[arg(long)]
    threshold: Option<f64>,

    #[arg(long)]
    artifact_root: Option<PathBuf>,

    #[arg(long)]
    layout: Option<ArtifactLayout>,

    /// Let a scoped run read unscoped artifacts when its own are missing.
    #[arg(long)]
    legacy_fallback: bool,

    #[arg(long)]
    trend_inputs: Option<TrendInputs>,
}

impl RunArgs {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut cfg = match &self.config {
            Some(path) => PipelineConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(input) = self.input {
            cfg.input.path = Some(input);
        }
        if let Some(encoding) = self.encoding {
            cfg.input.encoding = encoding;
        }
        if let Some(id) = self.submission_id.filter(|s| !s.trim().is_empty()) {
            cfg.submission_id = Some(SubmissionId::new(id)?);
        }
        if let Some(c) = self.contamination {
            cfg.anomaly.contamination = c;
        }
        if let Some(t) = self.threshold {
            cfg.trend.threshold = t;
        }
        if let Some(root) = self.artifact_root {
            cfg.artifacts.root = root;
        }
        if let Some(layout) = self.layout {
            cfg.artifacts.layout = layout;
        }
        if self.legacy_fallback {
            cfg.artifacts.fallback = FallbackPolicy::Legacy;
        }
        if let Some(inputs) = self.trend_inputs {
            cfg.trend.inputs = inputs;
        }
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let pipeline = Pipeline::new(args.into_config()?)?;
            info!(
                "artifacts under {} ({:?} layout)",
                pipeline.config().artifacts.root.display(),
                pipeline.config().artifacts.layout
            );
            let report = pipeline.run().context("Pipeline run failed")?;
            println!(
                "{} flagged, {} anomalies, {} yearly alerts ({:.2}s)",
                report.flagged, report.anomalies, report.yearly_alerts, report.duration_secs
            );
        }
        Command::Stage { stage, args } => {
            let pipeline = Pipeline::new(args.into_config()?)?;
            let report = pipeline
                .run_stage(stage)
                .with_context(|| format!("Stage '{stage}' failed"))?;
            for path in &report.outputs {
                println!("{}", path.display());
            }
        }
        Command::Resolve { stage, args } => {
            let pipeline = Pipeline::new(args.into_config()?)?;
            let path = pipeline.resolve_input(stage)?;
            info!("[{stage}] resolves to {}", path.display());
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn encoding_flag_reaches_input_config() {
        let cfg = run_args(&["emission-sentinel", "run", "--encoding", "latin1"])
            .into_config()
            .unwrap();
        assert_eq!(cfg.input.encoding, TextEncoding::Latin1);
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert!(Cli::try_parse_from(["emission-sentinel", "run", "--encoding", "ebcdic"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = run_args(&[
            "emission-sentinel",
            "run",
            "--submission-id",
            "42",
            "--trend-inputs",
            "year-features",
            "--legacy-fallback",
        ])
        .into_config()
        .unwrap();
        assert_eq!(cfg.submission_id.unwrap().as_str(), "42");
        assert_eq!(cfg.trend.inputs, TrendInputs::YearFeatures);
        assert_eq!(cfg.artifacts.fallback, FallbackPolicy::Legacy);
    }
}
