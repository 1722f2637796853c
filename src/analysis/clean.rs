use log::{debug, info};

use crate::data::model::Table;
use crate::data::schema::Schema;
use crate::error::{PipelineError, Result};

/// Result of [`clean`].
#[derive(Debug, Clone)]
pub struct CleanOutcome {
    /// Complete rows only, resolved columns renamed to canonical names.
    pub table: Table,
    pub rows_before: usize,
    pub rows_after: usize,
}

/// Per-column count of missing cells, in column order.
pub fn null_counts(table: &Table) -> Vec<(String, usize)> {
    table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.clone(), table.column(idx).filter(|v| v.is_null()).count()))
        .collect()
}

/// Drop every row with a missing value in any column.
///
/// A row passes only when all of its cells are present; partial records
/// are excluded rather than imputed. The schema must resolve, and at least
/// one row must survive.
pub fn clean(mut table: Table) -> Result<CleanOutcome> {
    let schema = Schema::resolve(&table)?;
    let rows_before = table.len();

    for (col, n) in null_counts(&table) {
        if n > 0 {
            debug!("column '{col}': {n} missing cells");
        }
    }

    table.rows.retain(|row| row.iter().all(|v| !v.is_null()));
    let rows_after = table.len();
    info!("rows before cleaning: {rows_before}, after: {rows_after}");

    if table.is_empty() {
        return Err(PipelineError::EmptyResult {
            stage: "clean".to_string(),
            before: rows_before,
            after: rows_after,
        });
    }

    schema.canonicalize(&mut table);

    Ok(CleanOutcome {
        table,
        rows_before,
        rows_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::Value;

    fn raw_table() -> Table {
        Table::new(
            vec![
                "Facility Id".into(),
                "Reporting Year".into(),
                "Unit CO2 emissions (non-biogenic) ".into(),
                "Notes".into(),
            ],
            vec![
                vec![Value::Integer(1), Value::Integer(2015), Value::Float(10.0), Value::Text("a".into())],
                vec![Value::Integer(2), Value::Integer(2016), Value::Null, Value::Text("b".into())],
                vec![Value::Integer(3), Value::Integer(2017), Value::Float(30.0), Value::Null],
                vec![Value::Integer(4), Value::Integer(2018), Value::Float(40.0), Value::Text("d".into())],
            ],
        )
    }

    #[test]
    fn drops_rows_missing_any_column() {
        let out = clean(raw_table()).unwrap();
        assert_eq!(out.rows_before, 4);
        assert_eq!(out.rows_after, 2);
        assert!(out.table.rows.iter().flatten().all(|v| !v.is_null()));
        // order preserved
        let ids: Vec<_> = out.table.column(0).filter_map(Value::as_i64).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn renames_resolved_columns() {
        let out = clean(raw_table()).unwrap();
        assert_eq!(
            out.table.columns,
            vec!["facility_id", "reporting_year", "emission_value", "Notes"]
        );
    }

    #[test]
    fn all_rows_incomplete_is_an_error() {
        let table = Table::new(
            vec!["Reporting Year".into(), "Unit CO2 emissions (non-biogenic)".into()],
            vec![vec![Value::Integer(2015), Value::Null]],
        );
        match clean(table) {
            Err(PipelineError::EmptyResult { before, after, .. }) => {
                assert_eq!((before, after), (1, 0));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unresolvable_schema_is_an_error() {
        let table = Table::new(vec!["year".into(), "co2".into()], Vec::new());
        assert!(matches!(clean(table), Err(PipelineError::Schema { .. })));
    }

    #[test]
    fn null_counts_per_column() {
        let counts = null_counts(&raw_table());
        assert_eq!(counts[2], ("Unit CO2 emissions (non-biogenic)".to_string(), 1));
        assert_eq!(counts[3].1, 1);
    }

    #[test]
    fn nan_spellings_in_text_input_are_dropped() {
        use crate::data::loader::{read_table, ReadOptions};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nan.csv");
        std::fs::write(
            &path,
            "Reporting Year,Unit CO2 emissions (non-biogenic)\n\
             2015,10\n2016,NAN\n2017,30\n2018,Nan\n2019,50\n",
        )
        .unwrap();

        let out = clean(read_table(&path, &ReadOptions::default()).unwrap()).unwrap();
        assert_eq!((out.rows_before, out.rows_after), (5, 3));
        let years: Vec<_> = out.table.column(0).filter_map(Value::as_i64).collect();
        assert_eq!(years, vec![2015, 2017, 2019]);
        assert!(out.table.rows.iter().flatten().all(|v| !v.is_null()));
    }
}
