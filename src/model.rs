/// Observation, RateOfChangeResult, BaselineEntry, ComparisonResult, NwisError
/// core data structures and error handling
///
/// Core data types for the Virginia streamflow monitoring service.
///
/// This module defines the shared domain model imported by all other modules.
/// It contains no I/O: only types, their small invariant-preserving helpers,
/// and the error enums the rest of the crate returns.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Parameter codes
// ---------------------------------------------------------------------------

/// USGS parameter code for discharge (streamflow), in cubic feet per second.
pub const PARAM_DISCHARGE: &str = "00060";

/// USGS reports this value when a gauge has no valid reading.
pub const NO_DATA_SENTINEL: f64 = -999_999.0;

// ---------------------------------------------------------------------------
// Observation types
// ---------------------------------------------------------------------------

/// A single instantaneous discharge reading from one gauge.
///
/// `flow` is `None` when the upstream service reported something that is not
/// a number ("Ice", "Eqp", an empty string, or the no-data sentinel). The
/// record is still kept: its timestamp matters for window continuity.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub flow: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// One daily mean discharge value from the long-horizon history, used only
/// to build the P90 baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyValue {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub date: NaiveDate,
    pub flow: Option<f64>,
    pub latitude: Option<f64>,
}

/// Day-of-year of a UTC instant. Leap days (Dec 31 of a leap year is 366)
/// form their own bucket.
pub fn day_of_year(timestamp: DateTime<Utc>) -> u32 {
    timestamp.date_naive().ordinal()
}

/// Parses a discharge value as reported upstream, coercing anything that is
/// not a usable number to `None`.
pub fn parse_flow(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() || value == NO_DATA_SENTINEL {
        return None;
    }
    Some(value)
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// Coarse north/south split of the state, informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    North,
    South,
}

impl Region {
    /// Latitudes at or above `midpoint` are north.
    pub fn from_latitude(latitude: f64, midpoint: f64) -> Region {
        if latitude >= midpoint {
            Region::North
        } else {
            Region::South
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::North => "north",
            Region::South => "south",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "north" => Ok(Region::North),
            "south" => Ok(Region::South),
            other => Err(format!("unknown region label '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived results
// ---------------------------------------------------------------------------

/// A sample-count lookback with the wall-clock duration it stands for.
///
/// `samples` rows back is only `nominal_minutes` back when the gauge reports
/// on a regular cadence (5 minutes for the defaults).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookback {
    pub label: String,
    pub samples: usize,
    pub nominal_minutes: i64,
}

impl Lookback {
    pub fn new(label: &str, samples: usize, nominal_minutes: i64) -> Self {
        Self {
            label: label.to_string(),
            samples,
            nominal_minutes,
        }
    }

    /// The 1h/3h/6h lookbacks at a 5-minute cadence.
    pub fn defaults() -> Vec<Lookback> {
        vec![
            Lookback::new("1h", 12, 60),
            Lookback::new("3h", 36, 180),
            Lookback::new("6h", 72, 360),
        ]
    }
}

/// Latest reading of one gauge with its percent change per lookback label.
#[derive(Debug, Clone, PartialEq)]
pub struct RateOfChangeResult {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub flow: Option<f64>,
    pub pct_change: BTreeMap<String, Option<f64>>,
}

impl RateOfChangeResult {
    /// Percent change for `label`, `None` if undefined or not configured.
    pub fn pct(&self, label: &str) -> Option<f64> {
        self.pct_change.get(label).copied().flatten()
    }
}

/// Historical 90th-percentile flow for one gauge on one day-of-year.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineEntry {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub day_of_year: u32,
    pub p90_flow: f64,
    pub region: Option<Region>,
}

/// A rate-of-change row joined against the baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    pub current: RateOfChangeResult,
    pub p90_flow: Option<f64>,
    pub ratio: Option<f64>,
    pub high_flow: bool,
    pub region: Option<Region>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise when fetching or decoding USGS NWIS data.
#[derive(Debug, PartialEq)]
pub enum NwisError {
    /// Non-2xx HTTP response from the USGS API.
    HttpError(u16),
    /// The request never produced a response (DNS, TLS, timeout).
    RequestFailed(String),
    /// The response body could not be deserialized.
    ParseError(String),
    /// A replay or fixture file could not be read.
    SourceUnavailable(String),
}

impl fmt::Display for NwisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NwisError::HttpError(code) => write!(f, "HTTP error: {}", code),
            NwisError::RequestFailed(msg) => write!(f, "Request failed: {}", msg),
            NwisError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            NwisError::SourceUnavailable(msg) => write!(f, "Source unavailable: {}", msg),
        }
    }
}

impl std::error::Error for NwisError {}

/// Conditions that abort a pipeline run.
///
/// Everything recoverable (missing baseline, malformed flow, short history,
/// empty batch) is expressed as null fields instead and never reaches here.
#[derive(Debug)]
pub enum PipelineError {
    /// Reading or writing a file failed.
    Io { path: PathBuf, message: String },
    /// A persisted table exists but cannot be read as that table.
    MalformedFile { path: PathBuf, message: String },
    /// The configuration file is present but invalid.
    Config(String),
    /// Another run holds the lock file.
    RunInProgress(PathBuf),
    /// The history fetch needed for a baseline rebuild failed.
    Fetch(NwisError),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        PipelineError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        PipelineError::MalformedFile {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Io { path, message } => {
                write!(f, "I/O error on {}: {}", path.display(), message)
            }
            PipelineError::MalformedFile { path, message } => write!(
                f,
                "cannot read {} as a table: {} (fix or remove the file and rerun)",
                path.display(),
                message
            ),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::RunInProgress(path) => write!(
                f,
                "another run holds {}; remove it if no run is active",
                path.display()
            ),
            PipelineError::Fetch(err) => write!(f, "Fetch failed: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<NwisError> for PipelineError {
    fn from(err: NwisError) -> Self {
        PipelineError::Fetch(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_of_year_uses_utc_date() {
        let jan1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(day_of_year(jan1), 1);
        let jul18 = Utc.with_ymd_and_hms(2023, 7, 19, 3, 0, 0).unwrap();
        assert_eq!(day_of_year(jul18), 200);
    }

    #[test]
    fn test_leap_year_last_day_is_366() {
        let dec31 = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(day_of_year(dec31), 366);
        let dec31_common = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(day_of_year(dec31_common), 365);
    }

    #[test]
    fn test_parse_flow_coerces_non_numeric_to_none() {
        assert_eq!(parse_flow("123.5"), Some(123.5));
        assert_eq!(parse_flow(" 0 "), Some(0.0));
        assert_eq!(parse_flow("Ice"), None);
        assert_eq!(parse_flow(""), None);
        assert_eq!(parse_flow("Eqp"), None);
        assert_eq!(parse_flow("-999999"), None);
        assert_eq!(parse_flow("NaN"), None);
    }

    #[test]
    fn test_region_threshold_is_inclusive() {
        assert_eq!(Region::from_latitude(37.5, 37.5), Region::North);
        assert_eq!(Region::from_latitude(37.4999, 37.5), Region::South);
        assert_eq!(Region::from_latitude(38.9, 37.5), Region::North);
    }

    #[test]
    fn test_region_label_round_trips_through_display() {
        for region in [Region::North, Region::South] {
            assert_eq!(region.to_string().parse::<Region>(), Ok(region));
        }
        assert!("east".parse::<Region>().is_err());
    }

    #[test]
    fn test_default_lookbacks_are_five_minute_cadence() {
        for lookback in Lookback::defaults() {
            assert_eq!(lookback.samples as i64 * 5, lookback.nominal_minutes);
        }
    }

    #[test]
    fn test_pipeline_error_display_is_actionable() {
        let err = PipelineError::RunInProgress(PathBuf::from("data/.run.lock"));
        assert!(err.to_string().contains("data/.run.lock"));
        let err: PipelineError = NwisError::HttpError(503).into();
        assert_eq!(err.to_string(), "Fetch failed: HTTP error: 503");
    }
}
