//! Locating the logical fields of an emissions table.
//!
//! Source exports disagree on header spelling ("Unit CO2 emissions
//! (non-biogenic) " with a trailing space, canonical snake_case names after
//! cleaning, ...). Every stage runs the resolver on the table it reads; once
//! the cleaner has renamed the resolved columns to their canonical names the
//! resolution downstream is an exact match.

use std::fmt;

use super::model::Table;
use crate::error::{PipelineError, Result};

/// The logical fields the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    ReportingYear,
    EmissionValue,
    FacilityId,
    FacilityName,
    IndustrySector,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::ReportingYear,
        Field::EmissionValue,
        Field::FacilityId,
        Field::FacilityName,
        Field::IndustrySector,
    ];

    /// Name used in every artifact written after cleaning.
    pub fn canonical(self) -> &'static str {
        match self {
            Field::ReportingYear => "reporting_year",
            Field::EmissionValue => "emission_value",
            Field::FacilityId => "facility_id",
            Field::FacilityName => "facility_name",
            Field::IndustrySector => "industry_sector",
        }
    }

    /// Strings a raw header is matched against, canonical name first.
    pub fn targets(self) -> &'static [&'static str] {
        match self {
            Field::ReportingYear => &["reporting_year", "Reporting Year"],
            Field::EmissionValue => &["emission_value", "Unit CO2 emissions (non-biogenic)"],
            Field::FacilityId => &["facility_id", "Facility Id"],
            Field::FacilityName => &["facility_name", "Facility Name"],
            Field::IndustrySector => &["industry_sector", "Industry Type (sectors)"],
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Field::ReportingYear | Field::EmissionValue)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

/// A located column: its position and the raw header it was found under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumn {
    pub index: usize,
    pub name: String,
}

/// Column positions for every logical field of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub reporting_year: ResolvedColumn,
    pub emission_value: ResolvedColumn,
    pub facility_id: Option<ResolvedColumn>,
    pub facility_name: Option<ResolvedColumn>,
    pub industry_sector: Option<ResolvedColumn>,
}

impl Schema {
    /// Resolve all fields against a table's headers.
    pub fn resolve(table: &Table) -> Result<Schema> {
        Self::resolve_columns(&table.columns)
    }

    pub fn resolve_columns(columns: &[String]) -> Result<Schema> {
        Ok(Schema {
            reporting_year: resolve_required(columns, Field::ReportingYear)?,
            emission_value: resolve_required(columns, Field::EmissionValue)?,
            facility_id: resolve_field(columns, Field::FacilityId),
            facility_name: resolve_field(columns, Field::FacilityName),
            industry_sector: resolve_field(columns, Field::IndustrySector),
        })
    }

    pub fn get(&self, field: Field) -> Option<&ResolvedColumn> {
        match field {
            Field::ReportingYear => Some(&self.reporting_year),
            Field::EmissionValue => Some(&self.emission_value),
            Field::FacilityId => self.facility_id.as_ref(),
            Field::FacilityName => self.facility_name.as_ref(),
            Field::IndustrySector => self.industry_sector.as_ref(),
        }
    }

    /// Rename every resolved column of `table` to its canonical name.
    ///
    /// The schema must have been resolved from this table.
    pub fn canonicalize(&self, table: &mut Table) {
        for field in Field::ALL {
            if let Some(col) = self.get(field) {
                table.rename_column(col.index, field.canonical());
            }
        }
    }
}

/// Return the first column (in column order) matching `field`, if any.
///
/// A header matches when it equals, starts with, or contains one of the
/// field's targets. Headers are compared trimmed; matching is case-sensitive.
pub fn resolve_field(columns: &[String], field: Field) -> Option<ResolvedColumn> {
    columns.iter().enumerate().find_map(|(index, raw)| {
        let name = raw.trim();
        let hit = field
            .targets()
            .iter()
            .any(|t| name == *t || name.starts_with(t) || name.contains(t));
        hit.then(|| ResolvedColumn {
            index,
            name: raw.clone(),
        })
    })
}

/// Like [`resolve_field`] but a miss is a [`PipelineError::Schema`].
pub fn resolve_required(columns: &[String], field: Field) -> Result<ResolvedColumn> {
    resolve_field(columns, field).ok_or_else(|| PipelineError::Schema {
        field: field.to_string(),
        available: columns.to_vec(),
    })
}

/// Locate a derived column written by an earlier stage (exact name).
pub fn require_column(table: &Table, name: &str) -> Result<usize> {
    table
        .column_index(name)
        .ok_or_else(|| PipelineError::Schema {
            field: name.to_string(),
            available: table.columns.clone(),
        })
}
