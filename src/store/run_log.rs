/// Bounded log of completed update runs.
///
/// One row per run with its UTC completion time and the row counts it
/// produced; only the most recent `MAX_LOG_RECORDS` rows are kept.

use crate::logging::{self, Stage};
use crate::model::PipelineError;
use crate::store::files::{PendingWrite, columns, format_timestamp, open_table, parse_timestamp, render};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

pub const RUN_LOG_FILE: &str = "update_log.csv";
pub const MAX_LOG_RECORDS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub window_rows: usize,
    pub sites: usize,
    pub high_flow_sites: usize,
}

/// Rows written before the counts existed carry only the timestamp; their
/// counts read as zero.
#[derive(Debug, Deserialize)]
struct RunRow {
    #[serde(alias = "timestamp")]
    timestamp_utc: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    window_rows: Option<usize>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    sites: Option<usize>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    high_flow_sites: Option<usize>,
}

/// Reads existing records; unreadable rows are dropped.
pub fn read_run_log(path: &Path) -> Result<Vec<RunRecord>, PipelineError> {
    let Some(mut reader) = open_table(path)? else {
        return Ok(Vec::new());
    };
    let mut records = Vec::new();
    for (line, row) in reader.deserialize::<RunRow>().enumerate() {
        let parsed = row
            .map_err(|e| e.to_string())
            .and_then(|row| match parse_timestamp(&row.timestamp_utc) {
                Some(timestamp) => Ok(RunRecord {
                    timestamp,
                    window_rows: row.window_rows.unwrap_or(0),
                    sites: row.sites.unwrap_or(0),
                    high_flow_sites: row.high_flow_sites.unwrap_or(0),
                }),
                None => Err(format!("unparseable timestamp '{}'", row.timestamp_utc)),
            });
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => logging::warn(
                Stage::System,
                None,
                &format!("{} row {}: {}", path.display(), line + 2, e),
            ),
        }
    }
    Ok(records)
}

/// Renders the log with `record` appended, trimmed to the newest
/// `MAX_LOG_RECORDS` rows.
pub fn render_appended(path: &Path, record: RunRecord) -> Result<PendingWrite, PipelineError> {
    let mut records = read_run_log(path)?;
    records.push(record);
    let excess = records.len().saturating_sub(MAX_LOG_RECORDS);

    let header = columns(&["timestamp_utc", "window_rows", "sites", "high_flow_sites"]);
    let rows = records[excess..].iter().map(|r| {
        vec![
            format_timestamp(r.timestamp),
            r.window_rows.to_string(),
            r.sites.to_string(),
            r.high_flow_sites.to_string(),
        ]
    });
    render(path, &header, rows)
}
