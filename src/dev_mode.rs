/// Development mode utilities for working with recorded data
///
/// When live USGS data is unavailable, use this module to replay a recorded
/// window file as if it were arriving now. Each reading's timestamp is moved
/// forward by `days_offset` days, so a file captured last spring can drive
/// today's pipeline end to end.

use crate::ingest::ObservationSource;
use crate::logging::{self, Stage};
use crate::model::{NwisError, Observation};
use crate::store::files::read_observations;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;

/// Configuration for development mode data replay
pub struct DevMode {
    /// Shift recorded readings this many days forward
    pub days_offset: i64,
    /// Recorded window file (same layout as `gauge_data.csv`)
    pub source_file: PathBuf,
}

impl DevMode {
    /// Create a new dev mode configuration
    ///
    /// # Arguments
    /// * `source_file` - Recorded readings to replay
    /// * `days_offset` - Replay data as if it happened this many days later
    pub fn new(source_file: impl Into<PathBuf>, days_offset: i64) -> Self {
        Self {
            days_offset,
            source_file: source_file.into(),
        }
    }

    fn shift(&self) -> Duration {
        Duration::days(self.days_offset)
    }

    /// Range covered by the recorded file after shifting, if it has any rows.
    pub fn data_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, NwisError> {
        let recorded = self.read()?;
        let min = recorded.iter().map(|o| o.timestamp).min();
        let max = recorded.iter().map(|o| o.timestamp).max();
        Ok(min.zip(max).map(|(a, b)| (a + self.shift(), b + self.shift())))
    }

    fn read(&self) -> Result<Vec<Observation>, NwisError> {
        if !self.source_file.exists() {
            return Err(NwisError::SourceUnavailable(format!(
                "replay file {} not found",
                self.source_file.display()
            )));
        }
        read_observations(&self.source_file)
            .map_err(|e| NwisError::SourceUnavailable(e.to_string()))
    }
}

impl ObservationSource for DevMode {
    /// Readings whose shifted timestamp lies in `[start, end]`.
    fn fetch_observations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, NwisError> {
        let shift = self.shift();
        let readings: Vec<Observation> = self
            .read()?
            .into_iter()
            .map(|mut o| {
                o.timestamp += shift;
                o
            })
            .filter(|o| o.timestamp >= start && o.timestamp <= end)
            .collect();

        logging::info(
            Stage::Usgs,
            None,
            &format!(
                "Replayed {} readings from {} (offset {} days)",
                readings.len(),
                self.source_file.display(),
                self.days_offset
            ),
        );
        Ok(readings)
    }
}
