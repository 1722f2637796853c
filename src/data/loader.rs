use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use log::{debug, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};

use super::model::{Table, Value};
use crate::error::{PipelineError, Result};

/// Cell contents read as missing, in addition to the empty string.
const MISSING_TOKENS: &[&str] = &[
    "NA", "N/A", "n/a", "NaN", "nan", "-NaN", "-nan", "null", "NULL", "None", "#N/A", "#NA",
    "<NA>",
];

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How the bytes of a delimited file are turned into text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    /// UTF-8 when the bytes are valid UTF-8, Latin-1 otherwise.
    #[default]
    Auto,
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "latin-1", alias = "latin1")]
    Latin1,
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(TextEncoding::Auto),
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "windows-1252" | "cp1252" => {
                Ok(TextEncoding::Latin1)
            }
            other => Err(format!("unknown encoding '{other}'")),
        }
    }
}

/// Options for [`read_table`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub encoding: TextEncoding,
    /// Field delimiter; derived from the extension when `None`.
    pub delimiter: Option<u8>,
}

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load a table from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.csv` / `.txt` – comma separated, header row required
/// * `.tsv`          – tab separated
/// * `.parquet`      – any flat schema; nested columns are rendered as text
pub fn read_table(path: &Path, opts: &ReadOptions) -> Result<Table> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let table = match ext.as_str() {
        "parquet" | "pq" => read_parquet(path)?,
        "tsv" => read_delimited(path, opts.delimiter.unwrap_or(b'\t'), opts.encoding)?,
        _ => read_delimited(path, opts.delimiter.unwrap_or(b','), opts.encoding)?,
    };
    debug!(
        "read {} rows x {} columns from {}",
        table.len(),
        table.columns.len(),
        path.display()
    );
    Ok(table)
}

/// Persist a table as CSV.
///
/// The file is written next to its destination and renamed into place, so a
/// concurrent reader sees either the old artifact or the complete new one.
pub fn write_table(path: &Path, table: &Table) -> Result<()> {
    let tmp = temp_sibling(path);
    ensure_parent(path)?;
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        writer.write_record(&table.columns)?;
        for row in &table.rows {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush().map_err(|e| PipelineError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))
}

/// Persist a text artifact with the same write-then-rename discipline as
/// [`write_table`].
pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    let tmp = temp_sibling(path);
    ensure_parent(path)?;
    fs::write(&tmp, contents).map_err(|e| PipelineError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))
}

/// Decode raw file bytes to text.
pub fn decode_text(bytes: &[u8], encoding: TextEncoding) -> Cow<'_, str> {
    match encoding {
        TextEncoding::Auto => match std::str::from_utf8(bytes) {
            Ok(s) => Cow::Borrowed(s.strip_prefix('\u{feff}').unwrap_or(s)),
            Err(_) => {
                debug!("input is not valid UTF-8, decoding as Latin-1");
                encoding_rs::WINDOWS_1252
                    .decode_without_bom_handling(bytes)
                    .0
            }
        },
        TextEncoding::Utf8 => {
            let (text, had_errors) = encoding_rs::UTF_8.decode_with_bom_removal(bytes);
            if had_errors {
                warn!("input contained invalid UTF-8 sequences; they were replaced");
            }
            text
        }
        TextEncoding::Latin1 => {
            encoding_rs::WINDOWS_1252
                .decode_without_bom_handling(bytes)
                .0
        }
    }
}

/// Guess the type of a single text cell.
pub fn guess_value(raw: &str) -> Value {
    let s = raw.trim();
    if s.is_empty() || MISSING_TOKENS.contains(&s) {
        return Value::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        // spellings outside the token list ("NAN", "Nan") still mean missing
        return if f.is_nan() { Value::Null } else { Value::Float(f) };
    }
    match s {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::Text(s.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Delimited text loader
// ---------------------------------------------------------------------------

fn read_delimited(path: &Path, delimiter: u8, encoding: TextEncoding) -> Result<Table> {
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    let text = decode_text(&bytes, encoding);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        rows.push(record.iter().map(guess_value).collect());
    }

    Ok(Table::new(columns, rows))
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

fn read_parquet(path: &Path) -> Result<Table> {
    let file = fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.build()?;

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for batch_result in reader {
        let batch = batch_result?;
        let decoded: Vec<Vec<Value>> = batch
            .columns()
            .iter()
            .map(column_values)
            .collect::<Result<_>>()?;

        for row in 0..batch.num_rows() {
            rows.push(decoded.iter().map(|col| col[row].clone()).collect());
        }
    }

    Ok(Table::new(columns, rows))
}

/// Convert one Arrow column into cells, widening numeric types.
fn column_values(col: &ArrayRef) -> Result<Vec<Value>> {
    let dt = col.data_type();
    let values = if dt.is_integer() {
        let arr = cast(col, &DataType::Int64)?;
        let ints = arr.as_primitive::<Int64Type>();
        (0..ints.len())
            .map(|i| {
                if ints.is_null(i) {
                    Value::Null
                } else {
                    Value::Integer(ints.value(i))
                }
            })
            .collect()
    } else if dt.is_floating() {
        let arr = cast(col, &DataType::Float64)?;
        let floats = arr.as_primitive::<Float64Type>();
        (0..floats.len())
            .map(|i| {
                if floats.is_null(i) || floats.value(i).is_nan() {
                    Value::Null
                } else {
                    Value::Float(floats.value(i))
                }
            })
            .collect()
    } else if *dt == DataType::Boolean {
        let bools = col.as_boolean();
        (0..bools.len())
            .map(|i| {
                if bools.is_null(i) {
                    Value::Null
                } else {
                    Value::Bool(bools.value(i))
                }
            })
            .collect()
    } else {
        let arr = cast(col, &DataType::Utf8)?;
        let strings = arr.as_string::<i32>();
        (0..strings.len())
            .map(|i| {
                if strings.is_null(i) {
                    Value::Null
                } else {
                    guess_value(strings.value(i))
                }
            })
            .collect()
    };
    Ok(values)
}

// -- helpers --

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}
