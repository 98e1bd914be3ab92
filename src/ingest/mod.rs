/// Data ingestion from upstream services.
///
/// The pipeline only sees the two source traits below; `usgs` implements
/// them against the live NWIS services and `crate::dev_mode` against a
/// recorded window file.
///
/// Submodules:
/// - `usgs` — NWIS Instantaneous Values and Daily Values clients.

pub mod usgs;

use crate::config::MAX_HISTORY_YEARS;
use crate::logging::{self, Stage};
use crate::model::{DailyValue, NwisError, Observation};
use chrono::{DateTime, Duration, NaiveDate, Utc};

// ---------------------------------------------------------------------------
// Source traits
// ---------------------------------------------------------------------------

/// Recent instantaneous discharge readings for every gauge in scope.
pub trait ObservationSource {
    fn fetch_observations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, NwisError>;
}

/// Daily mean discharge history for every gauge in scope.
pub trait DailyHistorySource {
    fn fetch_daily(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyValue>, NwisError>;
}

// ---------------------------------------------------------------------------
// Chunked history fetch
// ---------------------------------------------------------------------------

/// Splits `years_back` years ending at `end` into consecutive, non-
/// overlapping ranges of at most `chunk_years` years (365-day years).
/// `years_back` is clamped to `0..=MAX_HISTORY_YEARS`, `chunk_years` to
/// `1..=MAX_HISTORY_YEARS`.
pub fn history_chunks(end: NaiveDate, years_back: i64, chunk_years: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let years_back = years_back.clamp(0, MAX_HISTORY_YEARS);
    let chunk_years = chunk_years.clamp(1, MAX_HISTORY_YEARS);
    let start = end
        .checked_sub_signed(Duration::days(years_back * 365))
        .unwrap_or(NaiveDate::MIN);
    let step = Duration::days(chunk_years * 365);

    let mut chunks = Vec::new();
    let mut cur_start = start;
    while cur_start < end {
        let cur_end = cur_start.checked_add_signed(step).map_or(end, |d| d.min(end));
        chunks.push((cur_start, cur_end));
        cur_start = cur_end + Duration::days(1);
    }
    chunks
}

/// Fetches the full history chunk by chunk, pausing between requests.
///
/// A failed chunk is logged and skipped so one bad range does not discard
/// twenty years of data; the call only fails if every chunk failed.
pub fn fetch_history(
    source: &dyn DailyHistorySource,
    end: NaiveDate,
    years_back: i64,
    chunk_years: i64,
    pause: std::time::Duration,
) -> Result<Vec<DailyValue>, NwisError> {
    let chunks = history_chunks(end, years_back, chunk_years);
    let mut all = Vec::new();
    let mut successful = 0;
    let mut last_error = None;

    for (i, (start, stop)) in chunks.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            std::thread::sleep(pause);
        }
        logging::info(Stage::Baseline, None, &format!("Fetching {} → {} ...", start, stop));
        match source.fetch_daily(*start, *stop) {
            Ok(values) => {
                successful += 1;
                all.extend(values);
            }
            Err(e) => {
                logging::log_usgs_failure(&format!("history chunk {}..{}", start, stop), &e);
                last_error = Some(e);
            }
        }
    }

    logging::log_history_summary(chunks.len(), successful, all.len());
    match last_error {
        Some(e) if successful == 0 => Err(e),
        _ => Ok(all),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
