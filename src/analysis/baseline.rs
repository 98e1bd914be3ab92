//! Day-of-year P90 baseline.
//!
//! Built once from long-horizon daily values and then only read. A rebuild
//! replaces the whole table; entries are never patched in place.

use crate::logging::{self, Stage};
use crate::model::{BaselineEntry, DailyValue, Region};
use chrono::Datelike;
use std::collections::BTreeMap;

/// The percentile the baseline is built on.
pub const BASELINE_QUANTILE: f64 = 0.9;

/// Linear-interpolation quantile of an ascending slice: position
/// `h = (n − 1)·q`, interpolated between the neighbouring order statistics.
pub fn quantile_linear(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let h = (sorted.len() - 1) as f64 * q;
    let lower = h.floor() as usize;
    let upper = h.ceil() as usize;
    let fraction = h - lower as f64;
    Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

/// Read-only `(entity_id, day_of_year) → P90` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineIndex {
    entries: BTreeMap<(String, u32), BaselineEntry>,
}

impl BaselineIndex {
    /// Builds the table from daily history. Values with no usable flow are
    /// skipped; a gauge/day with no usable values gets no entry.
    pub fn build(history: &[DailyValue], latitude_midpoint: f64) -> Self {
        struct Partition<'a> {
            name: Option<&'a str>,
            latitude: Option<f64>,
            by_day: BTreeMap<u32, Vec<f64>>,
        }

        let mut partitions: BTreeMap<&str, Partition> = BTreeMap::new();
        for value in history {
            let part = partitions
                .entry(value.entity_id.as_str())
                .or_insert_with(|| Partition {
                    name: None,
                    latitude: None,
                    by_day: BTreeMap::new(),
                });
            if part.name.is_none() {
                part.name = value.entity_name.as_deref();
            }
            if part.latitude.is_none() {
                part.latitude = value.latitude;
            }
            if let Some(flow) = value.flow.filter(|f| f.is_finite()) {
                part.by_day.entry(value.date.ordinal()).or_default().push(flow);
            }
        }

        let mut entries = BTreeMap::new();
        for (entity_id, part) in partitions {
            let region = part
                .latitude
                .map(|lat| Region::from_latitude(lat, latitude_midpoint));
            for (day_of_year, mut flows) in part.by_day {
                flows.sort_by(f64::total_cmp);
                if let Some(p90_flow) = quantile_linear(&flows, BASELINE_QUANTILE) {
                    entries.insert(
                        (entity_id.to_string(), day_of_year),
                        BaselineEntry {
                            entity_id: entity_id.to_string(),
                            entity_name: part.name.map(String::from),
                            day_of_year,
                            p90_flow,
                            region,
                        },
                    );
                }
            }
        }

        let index = Self { entries };
        logging::info(
            Stage::Baseline,
            None,
            &format!(
                "{} site-day combinations computed for {} sites.",
                index.len(),
                index.entity_count()
            ),
        );
        index
    }

    /// Replaces the whole table with one built from `history`.
    pub fn rebuild(&mut self, history: &[DailyValue], latitude_midpoint: f64) {
        *self = Self::build(history, latitude_midpoint);
    }

    /// Wraps entries loaded from a persisted table. On a repeated key the
    /// first entry is kept.
    pub fn from_entries(entries: Vec<BaselineEntry>) -> Self {
        let mut map = BTreeMap::new();
        for entry in entries {
            map.entry((entry.entity_id.clone(), entry.day_of_year))
                .or_insert(entry);
        }
        Self { entries: map }
    }

    pub fn lookup(&self, entity_id: &str, day_of_year: u32) -> Option<&BaselineEntry> {
        self.entries.get(&(entity_id.to_string(), day_of_year))
    }

    /// Region label recorded for a gauge at build time.
    pub fn region_of(&self, entity_id: &str) -> Option<Region> {
        let from = (entity_id.to_string(), 0);
        let to = (entity_id.to_string(), u32::MAX);
        self.entries
            .range(from..=to)
            .find_map(|(_, entry)| entry.region)
    }

    /// Entries ordered by gauge then day-of-year.
    pub fn entries(&self) -> impl Iterator<Item = &BaselineEntry> {
        self.entries.values()
    }

    pub fn entity_count(&self) -> usize {
        let mut ids: Vec<&str> = self.entries.keys().map(|(id, _)| id.as_str()).collect();
        ids.dedup();
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Availability of the baseline for a run.
///
/// The comparator degrades to null P90/ratio in both non-ready states; the
/// distinction only drives the diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum BaselineStatus {
    Ready(BaselineIndex),
    /// No baseline table exists yet.
    NotBuilt,
    /// A rebuild was attempted and failed.
    BuildFailed(String),
}

impl BaselineStatus {
    pub fn index(&self) -> Option<&BaselineIndex> {
        match self {
            BaselineStatus::Ready(index) => Some(index),
            _ => None,
        }
    }

    pub fn diagnostic(&self) -> String {
        match self {
            BaselineStatus::Ready(index) => format!(
                "Baseline ready: {} site-day entries for {} sites.",
                index.len(),
                index.entity_count()
            ),
            BaselineStatus::NotBuilt => {
                "No baseline yet: historical P90 table missing or without usable rows. \
                 Run `rebuild-baseline` to build it; P90 fields will be empty."
                    .to_string()
            }
            BaselineStatus::BuildFailed(reason) => format!(
                "Baseline build failed: {}. P90 fields will be empty until a rebuild succeeds.",
                reason
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
