/// Tabular (CSV) persistence for the window, the baseline and the outputs.
///
/// Reading is tolerant at the row level and strict at the table level: a
/// file whose header lacks a required column cannot be trusted at all and
/// aborts the run, while a single row with an unparseable timestamp is
/// skipped with a warning. Flow and coordinate cells that are not numbers
/// read as null.
///
/// Every write goes to a sibling `.tmp` file first and is renamed over the
/// target, so a crash mid-write never leaves a truncated table behind.
///
/// Column names written by the earlier pipeline (`site_no`, `site_name`,
/// `timestamp_utc`, `flow_cfs`, `p90_flow_cfs`, `north_south`) are accepted
/// as aliases when reading.

use crate::analysis::baseline::BaselineIndex;
use crate::logging::{self, Stage};
use crate::model::{
    BaselineEntry, ComparisonResult, Lookback, Observation, PipelineError, RateOfChangeResult,
    parse_flow,
};
use crate::sites::SiteCatalog;
use crate::store::window::ObservationStore;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File names
// ---------------------------------------------------------------------------

pub const WINDOW_FILE: &str = "gauge_data.csv";
pub const BASELINE_FILE: &str = "historical_p90.csv";
pub const RATE_OF_CHANGE_FILE: &str = "rate_of_change.csv";
pub const COMPARISON_FILE: &str = "high_flow_summary.csv";
pub const PROCESSED_FILE: &str = "gauge_data_processed.csv";

// ---------------------------------------------------------------------------
// Cell formatting
// ---------------------------------------------------------------------------

/// ISO-8601 UTC with a `Z` suffix.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts RFC 3339, the space-separated form pandas writes
/// (`2024-05-01 12:00:00+00:00`), and offset-less times taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn text(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// A rendered table waiting to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Writes `bytes` to `path` via a temp file and rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PipelineError::io(path, "path has no file name"))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name));

    let mut file = File::create(&tmp).map_err(|e| PipelineError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| PipelineError::io(&tmp, e))?;
    file.sync_all().map_err(|e| PipelineError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))
}

/// Commits rendered tables in order, stopping at the first failure.
///
/// Each file is replaced atomically but the set is not: tables earlier in
/// `writes` stay committed when a later one fails. Callers put the table
/// the next run depends on last.
pub fn commit(writes: &[PendingWrite]) -> Result<(), PipelineError> {
    for write in writes {
        atomic_write(&write.path, &write.bytes)?;
        logging::debug(
            Stage::System,
            None,
            &format!("Wrote {} bytes to {}", write.bytes.len(), write.path.display()),
        );
    }
    Ok(())
}

pub(crate) fn render(
    path: &Path,
    header: &[String],
    rows: impl Iterator<Item = Vec<String>>,
) -> Result<PendingWrite, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(header)
        .map_err(|e| PipelineError::io(path, e))?;
    for row in rows {
        writer
            .write_record(&row)
            .map_err(|e| PipelineError::io(path, e))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| PipelineError::io(path, e.error()))?;
    Ok(PendingWrite {
        path: path.to_path_buf(),
        bytes,
    })
}

pub(crate) fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Opens `path` for CSV reading, or `None` if it does not exist or is empty.
pub(crate) fn open_table(path: &Path) -> Result<Option<csv::Reader<File>>, PipelineError> {
    if !path.exists() {
        return Ok(None);
    }
    let metadata = fs::metadata(path).map_err(|e| PipelineError::io(path, e))?;
    if metadata.len() == 0 {
        return Ok(None);
    }
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    Ok(Some(csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file)))
}

/// Fails with `MalformedFile` unless every required column (or one of its
/// aliases) is in the header.
fn require_columns<R: Read>(
    path: &Path,
    reader: &mut csv::Reader<R>,
    required: &[&[&str]],
) -> Result<(), PipelineError> {
    let headers = reader
        .headers()
        .map_err(|e| PipelineError::malformed(path, e))?
        .clone();
    for names in required {
        if !names.iter().any(|name| headers.iter().any(|h| h == *name)) {
            return Err(PipelineError::malformed(
                path,
                format!("missing required column '{}'", names[0]),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WindowRow {
    #[serde(alias = "site_no")]
    entity_id: String,
    #[serde(default, alias = "site_name")]
    entity_name: Option<String>,
    #[serde(alias = "timestamp_utc")]
    timestamp: String,
    #[serde(default, alias = "flow_cfs")]
    flow: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    longitude: Option<f64>,
}

/// Reads a window file into observations. A missing file is an empty
/// window.
pub fn read_observations(path: &Path) -> Result<Vec<Observation>, PipelineError> {
    let Some(mut reader) = open_table(path)? else {
        return Ok(Vec::new());
    };
    require_columns(
        path,
        &mut reader,
        &[
            &["entity_id", "site_no"],
            &["timestamp", "timestamp_utc"],
            &["flow", "flow_cfs"],
        ],
    )?;

    let mut observations = Vec::new();
    let mut skipped = 0;
    for (line, record) in reader.deserialize::<WindowRow>().enumerate() {
        let row = match record {
            Ok(row) => row,
            Err(e) => {
                skipped += 1;
                logging::warn(
                    Stage::Window,
                    None,
                    &format!("{} row {}: {}", path.display(), line + 2, e),
                );
                continue;
            }
        };
        let Some(timestamp) = parse_timestamp(&row.timestamp) else {
            skipped += 1;
            logging::warn(
                Stage::Window,
                Some(&row.entity_id),
                &format!(
                    "{} row {}: unparseable timestamp '{}'",
                    path.display(),
                    line + 2,
                    row.timestamp
                ),
            );
            continue;
        };
        observations.push(Observation {
            entity_id: row.entity_id,
            entity_name: row.entity_name.filter(|n| !n.is_empty()),
            timestamp,
            flow: row.flow.as_deref().and_then(parse_flow),
            latitude: row.latitude,
            longitude: row.longitude,
        });
    }

    if skipped > 0 {
        logging::warn(
            Stage::Window,
            None,
            &format!("Skipped {} unreadable rows in {}", skipped, path.display()),
        );
    }
    Ok(observations)
}

/// Loads the persisted window into a store.
pub fn load_window(path: &Path) -> Result<ObservationStore, PipelineError> {
    Ok(ObservationStore::from_observations(read_observations(path)?))
}

#[derive(Debug, Deserialize)]
struct BaselineRow {
    #[serde(alias = "site_no")]
    entity_id: String,
    #[serde(default, alias = "site_name")]
    entity_name: Option<String>,
    day_of_year: u32,
    #[serde(alias = "p90_flow_cfs", deserialize_with = "csv::invalid_option")]
    p90_flow: Option<f64>,
    #[serde(default, alias = "north_south")]
    region_label: Option<String>,
}

/// Reads the baseline table. `None` means no baseline has been built yet:
/// the file is absent, empty, or holds no usable row.
pub fn load_baseline(path: &Path) -> Result<Option<BaselineIndex>, PipelineError> {
    let Some(mut reader) = open_table(path)? else {
        return Ok(None);
    };
    require_columns(
        path,
        &mut reader,
        &[
            &["entity_id", "site_no"],
            &["day_of_year"],
            &["p90_flow", "p90_flow_cfs"],
        ],
    )?;

    let mut entries = Vec::new();
    for (line, record) in reader.deserialize::<BaselineRow>().enumerate() {
        let row = match record {
            Ok(row) => row,
            Err(e) => {
                logging::warn(
                    Stage::Baseline,
                    None,
                    &format!("{} row {}: {}", path.display(), line + 2, e),
                );
                continue;
            }
        };
        let (Some(p90_flow), true) = (row.p90_flow, (1..=366).contains(&row.day_of_year)) else {
            logging::warn(
                Stage::Baseline,
                Some(&row.entity_id),
                &format!("{} row {}: no usable P90 value", path.display(), line + 2),
            );
            continue;
        };
        entries.push(BaselineEntry {
            entity_id: row.entity_id,
            entity_name: row.entity_name.filter(|n| !n.is_empty()),
            day_of_year: row.day_of_year,
            p90_flow,
            region: row.region_label.and_then(|r| r.parse().ok()),
        });
    }
    if entries.is_empty() {
        logging::warn(
            Stage::Baseline,
            None,
            &format!("{} holds no usable P90 rows; treating as not built", path.display()),
        );
        return Ok(None);
    }
    Ok(Some(BaselineIndex::from_entries(entries)))
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn render_window(path: &Path, store: &ObservationStore) -> Result<PendingWrite, PipelineError> {
    let header = columns(&[
        "entity_id",
        "entity_name",
        "timestamp",
        "flow",
        "latitude",
        "longitude",
    ]);
    let rows = store.observations().map(|o| {
        vec![
            o.entity_id.clone(),
            text(o.entity_name.as_deref()),
            format_timestamp(o.timestamp),
            cell(o.flow),
            cell(o.latitude),
            cell(o.longitude),
        ]
    });
    render(path, &header, rows)
}

pub fn render_baseline(path: &Path, index: &BaselineIndex) -> Result<PendingWrite, PipelineError> {
    let header = columns(&[
        "entity_id",
        "entity_name",
        "day_of_year",
        "p90_flow",
        "region_label",
    ]);
    let rows = index.entries().map(|e| {
        vec![
            e.entity_id.clone(),
            text(e.entity_name.as_deref()),
            e.day_of_year.to_string(),
            e.p90_flow.to_string(),
            e.region.map(|r| r.to_string()).unwrap_or_default(),
        ]
    });
    render(path, &header, rows)
}

fn pct_columns(lookbacks: &[Lookback]) -> impl Iterator<Item = String> + '_ {
    lookbacks.iter().map(|l| format!("pct_change_{}", l.label))
}

fn pct_cells<'a>(
    result: &'a RateOfChangeResult,
    lookbacks: &'a [Lookback],
) -> impl Iterator<Item = String> + 'a {
    lookbacks.iter().map(|l| cell(result.pct(&l.label)))
}

pub fn render_rate_of_change(
    path: &Path,
    results: &[RateOfChangeResult],
    lookbacks: &[Lookback],
) -> Result<PendingWrite, PipelineError> {
    let mut header = columns(&["entity_id", "entity_name", "timestamp", "flow"]);
    header.extend(pct_columns(lookbacks));

    let rows = results.iter().map(|r| {
        let mut row = vec![
            r.entity_id.clone(),
            text(r.entity_name.as_deref()),
            format_timestamp(r.timestamp),
            cell(r.flow),
        ];
        row.extend(pct_cells(r, lookbacks));
        row
    });
    render(path, &header, rows)
}

pub fn render_comparisons(
    path: &Path,
    rows: &[ComparisonResult],
) -> Result<PendingWrite, PipelineError> {
    let header = columns(&[
        "entity_id",
        "entity_name",
        "timestamp",
        "flow",
        "p90_flow",
        "ratio",
        "high_flow",
        "region",
    ]);
    let rows = rows.iter().map(|r| {
        vec![
            r.current.entity_id.clone(),
            text(r.current.entity_name.as_deref()),
            format_timestamp(r.current.timestamp),
            cell(r.current.flow),
            cell(r.p90_flow),
            cell(r.ratio),
            r.high_flow.to_string(),
            r.region.map(|g| g.to_string()).unwrap_or_default(),
        ]
    });
    render(path, &header, rows)
}

/// One row per gauge with every derived field and its coordinates.
pub fn render_processed(
    path: &Path,
    rows: &[ComparisonResult],
    lookbacks: &[Lookback],
    sites: &SiteCatalog,
) -> Result<PendingWrite, PipelineError> {
    let mut header = columns(&["entity_id", "entity_name", "timestamp", "flow"]);
    header.extend(pct_columns(lookbacks));
    header.extend(columns(&[
        "p90_flow",
        "ratio",
        "high_flow",
        "region",
        "latitude",
        "longitude",
    ]));

    let rows = rows.iter().map(|r| {
        let site = sites.find(&r.current.entity_id);
        let mut row = vec![
            r.current.entity_id.clone(),
            text(r.current.entity_name.as_deref()),
            format_timestamp(r.current.timestamp),
            cell(r.current.flow),
        ];
        row.extend(pct_cells(&r.current, lookbacks));
        row.extend([
            cell(r.p90_flow),
            cell(r.ratio),
            r.high_flow.to_string(),
            r.region.map(|g| g.to_string()).unwrap_or_default(),
            cell(site.and_then(|s| s.latitude)),
            cell(site.and_then(|s| s.longitude)),
        ]);
        row
    });
    render(path, &header, rows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Region;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_timestamp_accepts_usgs_and_pandas_forms() {
        assert_eq!(parse_timestamp("2024-05-01T12:00:00Z"), Some(ts()));
        assert_eq!(parse_timestamp("2024-05-01T08:00:00.000-04:00"), Some(ts()));
        assert_eq!(parse_timestamp("2024-05-01 12:00:00+00:00"), Some(ts()));
        assert_eq!(parse_timestamp("2024-05-01 12:00:00"), Some(ts()));
        assert_eq!(parse_timestamp("not-a-datetime"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_window_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WINDOW_FILE);
        let store = ObservationStore::from_observations(vec![
            Observation {
                entity_id: "02037500".to_string(),
                entity_name: Some("JAMES RIVER NEAR RICHMOND, VA".to_string()),
                timestamp: ts(),
                flow: Some(5230.0),
                latitude: Some(37.563),
                longitude: Some(-77.547),
            },
            Observation {
                entity_id: "02037500".to_string(),
                entity_name: None,
                timestamp: ts() + Duration::minutes(5),
                flow: None,
                latitude: None,
                longitude: None,
            },
        ]);

        commit(&[render_window(&path, &store).unwrap()]).unwrap();
        let loaded = load_window(&path).unwrap();
        assert_eq!(loaded, store);
        assert!(!dir.path().join("gauge_data.csv.tmp").exists());
    }

    #[test]
    fn test_missing_window_file_is_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = load_window(&dir.path().join(WINDOW_FILE)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_legacy_columns_and_malformed_cells_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WINDOW_FILE);
        fs::write(
            &path,
            "site_no,site_name,timestamp_utc,flow_cfs,latitude,longitude\n\
             01646500,\"POTOMAC RIVER NEAR WASH, DC\",2024-05-01 12:00:00+00:00,Ice,38.949,-77.127\n\
             01646500,\"POTOMAC RIVER NEAR WASH, DC\",garbage,100,38.949,-77.127\n\
             01646500,,2024-05-01T12:05:00Z,101.5,,\n",
        )
        .unwrap();

        let rows = read_observations(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].flow, None);
        assert_eq!(rows[0].entity_name.as_deref(), Some("POTOMAC RIVER NEAR WASH, DC"));
        assert_eq!(rows[1].flow, Some(101.5));
        assert_eq!(rows[1].latitude, None);
    }

    #[test]
    fn test_window_without_required_column_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WINDOW_FILE);
        fs::write(&path, "entity_id,flow\n01646500,10\n").unwrap();
        let err = read_observations(&path).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedFile { .. }));
        assert!(err.to_string().contains("timestamp"));
    }

    #[test]
    fn test_baseline_absent_or_empty_means_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BASELINE_FILE);
        assert_eq!(load_baseline(&path).unwrap(), None);
        fs::write(&path, "").unwrap();
        assert_eq!(load_baseline(&path).unwrap(), None);
    }

    #[test]
    fn test_baseline_without_usable_rows_means_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BASELINE_FILE);
        fs::write(&path, "entity_id,entity_name,day_of_year,p90_flow,region_label\n").unwrap();
        assert_eq!(load_baseline(&path).unwrap(), None);

        fs::write(
            &path,
            "entity_id,day_of_year,p90_flow\n\
             01646500,0,10\n\
             01646500,12,\n\
             01646500,abc,5\n",
        )
        .unwrap();
        assert_eq!(load_baseline(&path).unwrap(), None);
    }

    #[test]
    fn test_baseline_round_trips_and_reads_legacy_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BASELINE_FILE);
        let index = BaselineIndex::from_entries(vec![BaselineEntry {
            entity_id: "02077000".to_string(),
            entity_name: Some("BANISTER RIVER AT HALIFAX, VA".to_string()),
            day_of_year: 200,
            p90_flow: 812.5,
            region: Some(Region::South),
        }]);
        commit(&[render_baseline(&path, &index).unwrap()]).unwrap();
        assert_eq!(load_baseline(&path).unwrap(), Some(index));

        fs::write(
            &path,
            "site_no,site_name,north_south,day_of_year,p90_flow_cfs\n\
             01646500,POTOMAC,north,1,1500.0\n\
             01646500,POTOMAC,north,400,1.0\n\
             01646500,POTOMAC,north,2,\n",
        )
        .unwrap();
        let legacy = load_baseline(&path).unwrap().expect("baseline present");
        assert_eq!(legacy.len(), 1);
        let entry = legacy.lookup("01646500", 1).unwrap();
        assert_eq!(entry.p90_flow, 1500.0);
        assert_eq!(entry.region, Some(Region::North));
    }

    #[test]
    fn test_rate_of_change_output_has_one_column_per_lookback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RATE_OF_CHANGE_FILE);
        let result = RateOfChangeResult {
            entity_id: "X1".to_string(),
            entity_name: None,
            timestamp: ts(),
            flow: Some(15.0),
            pct_change: BTreeMap::from([
                ("1h".to_string(), Some(50.0)),
                ("3h".to_string(), None),
                ("6h".to_string(), Some(-12.5)),
            ]),
        };
        let write = render_rate_of_change(&path, &[result], &Lookback::defaults()).unwrap();
        let body = String::from_utf8(write.bytes).unwrap();
        assert_eq!(
            body,
            "entity_id,entity_name,timestamp,flow,pct_change_1h,pct_change_3h,pct_change_6h\n\
             X1,,2024-05-01T12:00:00Z,15,50,,-12.5\n"
        );
    }

    #[test]
    fn test_comparison_output_columns() {
        let row = ComparisonResult {
            current: RateOfChangeResult {
                entity_id: "X1".to_string(),
                entity_name: Some("Gauge, with comma".to_string()),
                timestamp: ts(),
                flow: Some(120.0),
                pct_change: BTreeMap::new(),
            },
            p90_flow: Some(100.0),
            ratio: Some(1.2),
            high_flow: true,
            region: Some(Region::North),
        };
        let write = render_comparisons(Path::new("out.csv"), &[row]).unwrap();
        let body = String::from_utf8(write.bytes).unwrap();
        assert_eq!(
            body,
            "entity_id,entity_name,timestamp,flow,p90_flow,ratio,high_flow,region\n\
             X1,\"Gauge, with comma\",2024-05-01T12:00:00Z,120,100,1.2,true,north\n"
        );
    }

    #[test]
    fn test_atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }
}
