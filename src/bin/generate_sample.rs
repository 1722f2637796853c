use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::Parser;
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Write a synthetic multi-facility emissions table with source-style headers.
#[derive(Parser, Debug)]
#[command(name = "generate_sample")]
struct Args {
    /// Output file; `.parquet` writes Parquet, anything else CSV.
    #[arg(short, long, default_value = "sample_emissions.csv")]
    output: PathBuf,

    #[arg(long, default_value_t = 12)]
    facilities: usize,

    #[arg(long, default_value_t = 2010)]
    first_year: i64,

    #[arg(long, default_value_t = 2024)]
    last_year: i64,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

const SECTORS: [&str; 4] = ["Power Plants", "Refineries", "Chemicals", "Minerals"];

/// One row, with `None` for cells left blank in the export.
struct Record {
    facility_id: i64,
    facility_name: String,
    sector: &'static str,
    year: i64,
    emission: Option<f64>,
}

/// Box-Muller transform for a normal deviate.
fn gauss(rng: &mut StdRng, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-15);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z
}

fn generate(args: &Args) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut records = Vec::new();

    for f in 0..args.facilities {
        let base = rng.gen_range(20_000.0..400_000.0);
        let slope = rng.gen_range(-0.03..0.02) * base;
        let sector = SECTORS[f % SECTORS.len()];

        for year in args.first_year..=args.last_year {
            let t = (year - args.first_year) as f64;
            let mut value = (base + slope * t + gauss(&mut rng, 0.0, base * 0.04)).max(0.0);
            // occasional misreported year
            if rng.gen_bool(0.03) {
                value *= rng.gen_range(1.6..3.0);
            }
            let emission = (!rng.gen_bool(0.02)).then_some(value);

            records.push(Record {
                facility_id: 1_000_000 + f as i64,
                facility_name: format!("Facility {:02}", f + 1),
                sector,
                year,
                emission,
            });
        }
    }
    records
}

const HEADERS: [&str; 5] = [
    "Facility Id",
    "Facility Name",
    "Industry Type (sectors)",
    "Reporting Year",
    "Unit CO2 emissions (non-biogenic) ",
];

fn write_csv(path: &Path, records: &[Record]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(HEADERS)?;
    for r in records {
        writer.write_record([
            r.facility_id.to_string(),
            r.facility_name.clone(),
            r.sector.to_string(),
            r.year.to_string(),
            r.emission.map(|v| format!("{v:.1}")).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_parquet(path: &Path, records: &[Record]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new(HEADERS[0], DataType::Int64, false),
        Field::new(HEADERS[1], DataType::Utf8, false),
        Field::new(HEADERS[2], DataType::Utf8, false),
        Field::new(HEADERS[3], DataType::Int64, false),
        Field::new(HEADERS[4], DataType::Float64, true),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.facility_id))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.facility_name.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.sector))),
            Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.year))),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.emission).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("Failed to create RecordBatch")?;

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("Failed to create writer")?;
    writer.write(&batch).context("Failed to write batch")?;
    writer.close().context("Failed to close writer")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    anyhow::ensure!(
        args.first_year <= args.last_year,
        "first year {} is after last year {}",
        args.first_year,
        args.last_year
    );

    let records = generate(&args);
    let is_parquet = args
        .output
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("parquet"));
    if is_parquet {
        write_parquet(&args.output, &records)?;
    } else {
        write_csv(&args.output, &records)?;
    }

    log::info!(
        "wrote {} records for {} facilities to {}",
        records.len(),
        args.facilities,
        args.output.display()
    );
    println!("Wrote {} records to {}", records.len(), args.output.display());
    Ok(())
}
