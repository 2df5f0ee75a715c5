//! Spreadsheet input: one worksheet, one column of hostnames.

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};

use crate::config::Config;

/// Position of the identifier column in the header row.
fn column_position(header: &[Data], column: &str, sheet: &str) -> Result<usize> {
    header
        .iter()
        .position(|cell| cell_to_string(cell).trim() == column)
        .with_context(|| format!("column '{column}' not found in sheet '{sheet}'"))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(v) => v.to_string(),
        Data::Float(v) => v.to_string(),
        Data::Int(v) => v.to_string(),
        Data::Bool(v) => v.to_string(),
        Data::DateTime(v) => v.to_string(),
        Data::DateTimeIso(v) => v.to_string(),
        Data::DurationIso(v) => v.to_string(),
        Data::Error(v) => format!("{v:?}"),
        Data::Empty => String::new(),
    }
}

/// Read the identifier column from the configured workbook and return the
/// cleaned, deduplicated list. Fails with a descriptive error when the file,
/// sheet or column is missing; callers run this before any browser exists.
pub fn read_identifiers(cfg: &Config) -> Result<Vec<String>> {
    let mut workbook = open_workbook_auto(&cfg.excel_path)
        .with_context(|| format!("failed to open spreadsheet: {}", cfg.excel_path.display()))?;

    let range = workbook
        .worksheet_range(&cfg.excel_sheet)
        .with_context(|| {
            format!(
                "sheet '{}' not found in {}",
                cfg.excel_sheet,
                cfg.excel_path.display()
            )
        })?;

    let mut rows = range.rows();
    let header = rows
        .next()
        .with_context(|| format!("sheet '{}' is empty", cfg.excel_sheet))?;
    let column = column_position(header, &cfg.excel_column, &cfg.excel_sheet)?;

    let raw = rows.map(|row| row.get(column).map(cell_to_string).unwrap_or_default());
    Ok(clean_identifiers(raw, cfg.max_rows))
}

/// Trim, drop blanks and the textual `nan`/`none` artifacts, deduplicate
/// keeping the first occurrence, and apply the optional row cap.
pub fn clean_identifiers(
    raw: impl IntoIterator<Item = String>,
    cap: Option<usize>,
) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut values = Vec::new();

    for value in raw {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let lower = value.to_lowercase();
        if lower == "nan" || lower == "none" {
            continue;
        }
        if seen.insert(value.to_string()) {
            values.push(value.to_string());
        }
        if let Some(cap) = cap {
            if values.len() == cap {
                break;
            }
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_blanks_and_nan_dropped_dedup_keeps_first() {
        let out = clean_identifiers(strings(&["A", "", "nan", "A", "B"]), None);
        assert_eq!(out, strings(&["A", "B"]));
    }

    #[test]
    fn test_none_is_dropped_case_insensitive() {
        let out = clean_identifiers(strings(&["None", "NAN", "host1"]), None);
        assert_eq!(out, strings(&["host1"]));
    }

    #[test]
    fn test_values_are_trimmed_before_dedup() {
        let out = clean_identifiers(strings(&["  host1  ", "host1", "host2"]), None);
        assert_eq!(out, strings(&["host1", "host2"]));
    }

    #[test]
    fn test_row_cap_honored() {
        let out = clean_identifiers(strings(&["A", "B", "C"]), Some(2));
        assert_eq!(out, strings(&["A", "B"]));
    }

    #[test]
    fn test_cap_counts_unique_values_only() {
        let out = clean_identifiers(strings(&["A", "A", "B", "C"]), Some(2));
        assert_eq!(out, strings(&["A", "B"]));
    }

    #[test]
    fn test_column_lookup_trims_header_cells() {
        let header = vec![
            Data::String(" SITE ".to_string()),
            Data::String(" HOSTNAME ".to_string()),
        ];
        assert_eq!(column_position(&header, "HOSTNAME", "s").unwrap(), 1);
    }

    #[test]
    fn test_missing_column_is_descriptive() {
        let header = vec![Data::String("SITE".to_string()), Data::Empty];
        let err = column_position(&header, "HOSTNAME", "INVENTARIO RAD").unwrap_err();
        assert_eq!(
            err.to_string(),
            "column 'HOSTNAME' not found in sheet 'INVENTARIO RAD'"
        );
    }

    #[test]
    fn test_missing_file_is_descriptive() {
        let cfg = Config::from_lookup(|key| match key {
            "INSTANCE_URL" => Some("https://example.service-now.com".to_string()),
            "EXCEL_PATH" => Some("does-not-exist.xlsx".to_string()),
            _ => None,
        })
        .unwrap();
        let err = read_identifiers(&cfg).unwrap_err();
        assert!(err.to_string().contains("does-not-exist.xlsx"));
    }
}
