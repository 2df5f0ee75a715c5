//! Per-item outcomes and the CSV report.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

/// Report file written in the working directory after the full run.
pub const REPORT_FILE: &str = "resultado_facility.csv";

/// Whether an identifier was updated and saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => f.write_str("OK"),
            Status::Error => f.write_str("ERROR"),
        }
    }
}

/// One processed identifier. Created once, never mutated. Serialization
/// names double as the report's column headers.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    #[serde(rename = "HOSTNAME")]
    pub value: String,
    #[serde(rename = "STATUS")]
    pub status: Status,
    #[serde(rename = "DETALHE")]
    pub detail: String,
}

impl Outcome {
    pub fn ok(value: &str, detail: &str) -> Self {
        Self {
            value: value.to_string(),
            status: Status::Ok,
            detail: detail.to_string(),
        }
    }

    pub fn error(value: &str, detail: String) -> Self {
        Self {
            value: value.to_string(),
            status: Status::Error,
            detail,
        }
    }
}

/// Write the report: a header row plus one row per outcome, overwriting any
/// existing file.
pub fn write_report(path: &Path, outcomes: &[Outcome]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create report: {}", path.display()))?;

    if outcomes.is_empty() {
        // serialize() only emits the header alongside a record.
        writer.write_record(["HOSTNAME", "STATUS", "DETALHE"])?;
    }
    for outcome in outcomes {
        writer.serialize(outcome)?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write report: {}", path.display()))?;

    info!("Report saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(|f| f.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_report_has_header_plus_one_row_per_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let outcomes = vec![
            Outcome::ok("host1", "Atualizado e salvo."),
            Outcome::error("host2", "Timeout: timed out waiting for record form".to_string()),
            Outcome::ok("host3", "Atualizado e salvo."),
        ];
        write_report(&path, &outcomes).unwrap();

        let rows = read_rows(&path);
        assert_eq!(rows.len(), outcomes.len() + 1);
        assert_eq!(rows[0], vec!["HOSTNAME", "STATUS", "DETALHE"]);
        for row in &rows[1..] {
            assert!(row[1] == "OK" || row[1] == "ERROR");
        }
    }

    #[test]
    fn test_end_to_end_rows_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let outcomes = vec![
            Outcome::ok("host1", "Atualizado e salvo."),
            Outcome::error("host2", "could not locate or set Facility type".to_string()),
        ];
        write_report(&path, &outcomes).unwrap();

        let rows = read_rows(&path);
        assert_eq!(rows[1], vec!["host1", "OK", "Atualizado e salvo."]);
        assert_eq!(
            rows[2],
            vec!["host2", "ERROR", "could not locate or set Facility type"]
        );
    }

    #[test]
    fn test_empty_run_still_writes_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        write_report(&path, &[]).unwrap();

        let rows = read_rows(&path);
        assert_eq!(rows, vec![vec!["HOSTNAME", "STATUS", "DETALHE"]]);
    }

    #[test]
    fn test_existing_report_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        write_report(&path, &[Outcome::ok("old", "Atualizado e salvo.")]).unwrap();
        write_report(&path, &[Outcome::ok("new", "Atualizado e salvo.")]).unwrap();

        let rows = read_rows(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "new");
    }
}
