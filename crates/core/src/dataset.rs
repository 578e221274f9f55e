//! Dataset snapshot assembly
//!
//! Turns the worker's delimited export of the in-memory frame into the
//! column-major JSON view served by `/view_data`.

use serde_json::Value;

use crate::protocol::{DatasetColumn, DatasetView};
use crate::{Error, Result};

/// Build a column-major view from delimited export text.
///
/// The first record is the header. Rows beyond `max_rows` are not
/// materialized; `total_rows` is the predicate-matching count reported by
/// the Engine, which may exceed what the export contains.
pub fn view_from_delimited(text: &str, total_rows: usize, max_rows: usize) -> Result<DatasetView> {
    let mut records = text.lines().filter(|l| !l.trim().is_empty());

    let header = match records.next() {
        Some(line) => parse_record(line),
        None => {
            return Ok(DatasetView {
                columns: Vec::new(),
                displayed_rows: 0,
                total_rows,
                max_rows,
            })
        }
    };

    let mut columns: Vec<DatasetColumn> = header
        .into_iter()
        .map(|name| DatasetColumn {
            name,
            values: Vec::new(),
        })
        .collect();

    let mut displayed = 0usize;
    for line in records.take(max_rows) {
        let fields = parse_record(line);
        if fields.len() != columns.len() {
            return Err(Error::Internal(format!(
                "dataset export row has {} fields, expected {}",
                fields.len(),
                columns.len()
            )));
        }
        for (column, field) in columns.iter_mut().zip(fields) {
            column.values.push(cell_value(&field));
        }
        displayed += 1;
    }

    Ok(DatasetView {
        columns,
        displayed_rows: displayed,
        total_rows,
        max_rows,
    })
}

/// Split one delimited record, honoring double-quote quoting with `""`
/// escapes (the Engine's export convention).
fn parse_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if field.is_empty() => quoted = true,
            ',' if !quoted => {
                fields.push(std::mem::take(&mut field));
            }
            _ => field.push(ch),
        }
    }
    fields.push(field);
    fields
}

/// Map one exported cell to JSON: numbers stay numeric, the Engine's `.`
/// missing marker (and extended `.a`..`.z`) becomes null, everything else
/// is a string.
fn cell_value(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    if field == "."
        || (field.len() == 2
            && field.starts_with('.')
            && field.chars().nth(1).is_some_and(|c| c.is_ascii_lowercase()))
    {
        return Value::Null;
    }
    if let Ok(n) = field.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = field.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::from(field)
}
