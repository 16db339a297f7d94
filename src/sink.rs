// 💾 Result Sinks - Where ledger entries go after a run
//
//   - JsonFileSink:  pretty JSON array (the classic results file)
//   - CsvFileSink:   one row per entry, source snapshot as a JSON column
//   - SqliteSink:    idempotent by entry hash (see `db`)

use crate::processor::LedgerEntry;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Anything that accepts the final ordered entry list
pub trait ResultSink {
    /// Returns the number of entries actually written
    fn write(&self, entries: &[LedgerEntry]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

/// File sink for the given format
pub fn file_sink<P: AsRef<Path>>(format: OutputFormat, path: P) -> Box<dyn ResultSink> {
    match format {
        OutputFormat::Json => Box::new(JsonFileSink::new(path)),
        OutputFormat::Csv => Box::new(CsvFileSink::new(path)),
    }
}

// ============================================================================
// JSON
// ============================================================================

#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        JsonFileSink {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ResultSink for JsonFileSink {
    fn write(&self, entries: &[LedgerEntry]) -> Result<usize> {
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create output file: {:?}", self.path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, entries)
            .context("Failed to write entries as JSON")?;
        writer.flush().context("Failed to flush JSON output")?;
        Ok(entries.len())
    }
}

/// Read back a results file written by `JsonFileSink`
pub fn read_entries_json<P: AsRef<Path>>(path: P) -> Result<Vec<LedgerEntry>> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("Failed to open results file: {:?}", path.as_ref()))?;
    let entries = serde_json::from_reader(BufReader::new(file))
        .context("Failed to parse results JSON")?;
    Ok(entries)
}

// ============================================================================
// CSV
// ============================================================================

/// Flat CSV shape of a ledger entry
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvEntryRecord<'a> {
    entry_id: &'a str,
    run_id: &'a str,
    rule_name: &'a str,
    valuation_dt: &'a str,
    account: &'a str,
    eagle_entity_id: &'a str,
    eagle_ledger_acct: &'a str,
    account_kind: &'static str,
    calculated_value: f64,
    data_definition: &'a str,
    ledger_definition: &'a str,
    source_data: String,
    processed_at: String,
}

#[derive(Debug, Clone)]
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CsvFileSink {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ResultSink for CsvFileSink {
    fn write(&self, entries: &[LedgerEntry]) -> Result<usize> {
        let mut wtr = csv::Writer::from_path(&self.path)
            .with_context(|| format!("Failed to create output file: {:?}", self.path))?;

        for entry in entries {
            wtr.serialize(CsvEntryRecord {
                entry_id: &entry.entry_id,
                run_id: &entry.run_id,
                rule_name: &entry.rule_name,
                valuation_dt: &entry.valuation_dt,
                account: &entry.account,
                eagle_entity_id: entry.entity_id.as_deref().unwrap_or(""),
                eagle_ledger_acct: &entry.ledger_account,
                account_kind: entry.account_kind.as_str(),
                calculated_value: entry.calculated_value,
                data_definition: &entry.formula,
                ledger_definition: &entry.account_template,
                source_data: serde_json::to_string(&entry.source_data)?,
                processed_at: entry.processed_at.to_rfc3339(),
            })
            .context("Failed to write CSV row")?;
        }

        wtr.flush().context("Failed to flush CSV output")?;
        Ok(entries.len())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountKind;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn create_test_entries() -> Vec<LedgerEntry> {
        let mut source = Map::new();
        source.insert("netAssets".to_string(), json!(1234.5));
        vec![
            LedgerEntry {
                entry_id: "e-1".to_string(),
                run_id: "run-1".to_string(),
                rule_name: "Net, Assets".to_string(),
                valuation_dt: "2024-01-31".to_string(),
                account: "FUND1".to_string(),
                entity_id: Some("E1".to_string()),
                ledger_account: "4000".to_string(),
                account_kind: AccountKind::Static,
                calculated_value: 1234.5,
                formula: "[netAssets]".to_string(),
                account_template: "4000".to_string(),
                source_data: source,
                processed_at: Utc::now(),
            },
            LedgerEntry {
                entry_id: "e-2".to_string(),
                run_id: "run-1".to_string(),
                rule_name: "Fees".to_string(),
                valuation_dt: "2024-01-31".to_string(),
                account: "FUND2".to_string(),
                entity_id: None,
                ledger_account: "UNKNOWN".to_string(),
                account_kind: AccountKind::Dynamic,
                calculated_value: -0.25,
                formula: "[fee] * -1".to_string(),
                account_template: "[feeAccount]".to_string(),
                source_data: Map::new(),
                processed_at: Utc::now(),
            },
        ]
    }

    #[test]
    fn test_json_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let entries = create_test_entries();

        let written = JsonFileSink::new(&path).write(&entries).unwrap();
        assert_eq!(written, 2);

        let read = read_entries_json(&path).unwrap();
        assert_eq!(read, entries);
    }

    // /dev/full accepts the open and fails every write with ENOSPC
    #[cfg(target_os = "linux")]
    #[test]
    fn test_json_sink_reports_failed_final_write() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let err = JsonFileSink::new(full)
            .write(&create_test_entries())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("JSON"));
    }

    #[test]
    fn test_csv_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let entries = create_test_entries();

        file_sink(OutputFormat::Csv, &path).write(&entries).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(&headers[0], "entryId");
        assert_eq!(&headers[6], "eagleLedgerAcct");

        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "Net, Assets");
        assert_eq!(rows[0][8].parse::<f64>().unwrap(), 1234.5);
        assert_eq!(&rows[1][5], "");
        assert_eq!(rows[1][8].parse::<f64>().unwrap(), -0.25);
        assert_eq!(&rows[0][11], r#"{"netAssets":1234.5}"#);
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("CSV".parse::<OutputFormat>(), Ok(OutputFormat::Csv));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
