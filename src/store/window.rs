/// The rolling observation window.
///
/// Holds every gauge's recent readings, unique by timestamp and kept in
/// ascending time order by construction. Appending merges a new batch,
/// drops exact `(entity_id, timestamp)` repeats and evicts anything older
/// than the retention horizon.
///
/// # Duplicate policy
/// First writer wins. A reading already in the window is never replaced by
/// a later one carrying the same key, and within a single batch the first
/// occurrence is the one kept. A re-fetch from USGS normally returns the
/// identical value for a timestamp it has already served.
///
/// # Clock injection
/// Operations that depend on the current time take `now: DateTime<Utc>`
/// instead of calling `Utc::now()`, so eviction is deterministic in tests.

use crate::logging::{self, Stage};
use crate::model::Observation;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Result of an `append` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The batch was empty; the window was left exactly as it was.
    NothingNew,
    Appended {
        added: usize,
        duplicates: usize,
        evicted: usize,
        retained: usize,
    },
}

/// Per-gauge ordered series of observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationStore {
    series: BTreeMap<String, BTreeMap<DateTime<Utc>, Observation>>,
}

impl ObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from already persisted rows, applying the same
    /// first-wins dedup as `append` but without evicting anything.
    pub fn from_observations(observations: Vec<Observation>) -> Self {
        let mut store = Self::new();
        store.insert_all(observations);
        store
    }

    /// Newest recorded timestamp across all gauges, or `now − retention`
    /// on a cold start.
    pub fn load_last_timestamp(&self, now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
        self.newest_timestamp().unwrap_or(now - retention)
    }

    /// Start of the next incremental fetch: one second past the newest
    /// reading so it is not requested again, or `now − retention` when the
    /// window is empty.
    pub fn fetch_start(&self, now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
        match self.newest_timestamp() {
            Some(last) => last + Duration::seconds(1),
            None => now - retention,
        }
    }

    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.series
            .values()
            .filter_map(|s| s.keys().next_back())
            .max()
            .copied()
    }

    /// Merges `new_observations`, dedups by `(entity_id, timestamp)` and
    /// evicts records older than `now − retention`. Records exactly at the
    /// cutoff are kept.
    ///
    /// An empty batch is a no-op: no eviction happens either, so a quiet
    /// period upstream never shrinks the persisted window on its own.
    pub fn append(
        &mut self,
        new_observations: Vec<Observation>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> AppendOutcome {
        if new_observations.is_empty() {
            logging::info(
                Stage::Window,
                None,
                "No new readings since last timestamp. Nothing to update.",
            );
            return AppendOutcome::NothingNew;
        }

        let incoming = new_observations.len();
        let added = self.insert_all(new_observations);
        let evicted = self.evict_older_than(now - retention);
        let retained = self.len();

        logging::info(
            Stage::Window,
            None,
            &format!(
                "Saved {} rows ({} new, {} duplicate, {} evicted)",
                retained,
                added,
                incoming - added,
                evicted
            ),
        );

        AppendOutcome::Appended {
            added,
            duplicates: incoming - added,
            evicted,
            retained,
        }
    }

    /// Returns the number of observations actually inserted.
    fn insert_all(&mut self, observations: Vec<Observation>) -> usize {
        let mut added = 0;
        for obs in observations {
            let series = self.series.entry(obs.entity_id.clone()).or_default();
            if let Entry::Vacant(slot) = series.entry(obs.timestamp) {
                slot.insert(obs);
                added += 1;
            }
        }
        added
    }

    /// Drops every observation strictly older than `cutoff`, and any gauge
    /// left with no observations. Returns how many were dropped.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for series in self.series.values_mut() {
            let kept = series.split_off(&cutoff);
            evicted += series.len();
            *series = kept;
        }
        self.series.retain(|_, s| !s.is_empty());
        evicted
    }

    /// One gauge's series in ascending time order.
    pub fn series(&self, entity_id: &str) -> Vec<&Observation> {
        self.series
            .get(entity_id)
            .map(|s| s.values().collect())
            .unwrap_or_default()
    }

    /// Every gauge with its ascending series, gauges ordered by id.
    pub fn iter_series(&self) -> impl Iterator<Item = (&str, Vec<&Observation>)> {
        self.series
            .iter()
            .map(|(id, s)| (id.as_str(), s.values().collect()))
    }

    /// All observations, ordered by gauge then time.
    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.series.values().flat_map(|s| s.values())
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
    }

    fn obs(site: &str, minutes_ago: i64, flow: Option<f64>) -> Observation {
        Observation {
            entity_id: site.to_string(),
            entity_name: Some(format!("Gauge {}", site)),
            timestamp: fixed_now() - Duration::minutes(minutes_ago),
            flow,
            latitude: Some(38.0),
            longitude: Some(-77.5),
        }
    }

    fn day() -> Duration {
        Duration::hours(24)
    }

    // --- Cold start / last timestamp ----------------------------------------

    #[test]
    fn test_cold_start_returns_now_minus_retention() {
        let store = ObservationStore::new();
        assert_eq!(
            store.load_last_timestamp(fixed_now(), day()),
            fixed_now() - day()
        );
        assert_eq!(store.fetch_start(fixed_now(), day()), fixed_now() - day());
    }

    #[test]
    fn test_last_timestamp_is_newest_across_gauges() {
        let store = ObservationStore::from_observations(vec![
            obs("01646500", 30, Some(100.0)),
            obs("02035000", 10, Some(50.0)),
            obs("01646500", 20, Some(101.0)),
        ]);
        let newest = fixed_now() - Duration::minutes(10);
        assert_eq!(store.load_last_timestamp(fixed_now(), day()), newest);
        assert_eq!(
            store.fetch_start(fixed_now(), day()),
            newest + Duration::seconds(1)
        );
    }

    // --- Append / dedup -----------------------------------------------------

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let mut store = ObservationStore::from_observations(vec![obs("01646500", 60 * 30, Some(1.0))]);
        let before = store.clone();
        let outcome = store.append(Vec::new(), day(), fixed_now());
        assert_eq!(outcome, AppendOutcome::NothingNew);
        // Not even the 30-hour-old row is evicted by an empty batch.
        assert_eq!(store, before);
    }

    #[test]
    fn test_appending_same_observation_twice_keeps_one_copy() {
        let mut store = ObservationStore::new();
        store.append(vec![obs("01646500", 5, Some(10.0))], day(), fixed_now());
        let outcome = store.append(vec![obs("01646500", 5, Some(10.0))], day(), fixed_now());

        assert_eq!(
            outcome,
            AppendOutcome::Appended {
                added: 0,
                duplicates: 1,
                evicted: 0,
                retained: 1
            }
        );
        assert_eq!(store.series("01646500").len(), 1);
    }

    #[test]
    fn test_first_writer_wins_on_key_collision() {
        let mut store = ObservationStore::new();
        store.append(vec![obs("01646500", 5, Some(10.0))], day(), fixed_now());
        store.append(vec![obs("01646500", 5, Some(99.0))], day(), fixed_now());
        assert_eq!(store.series("01646500")[0].flow, Some(10.0));

        // Within a single batch the first occurrence is kept as well.
        let mut store = ObservationStore::new();
        store.append(
            vec![obs("01646500", 5, Some(1.0)), obs("01646500", 5, Some(2.0))],
            day(),
            fixed_now(),
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.series("01646500")[0].flow, Some(1.0));
    }

    #[test]
    fn test_same_timestamp_on_different_gauges_is_not_a_duplicate() {
        let mut store = ObservationStore::new();
        store.append(
            vec![obs("01646500", 5, Some(1.0)), obs("02035000", 5, Some(2.0))],
            day(),
            fixed_now(),
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_null_flow_records_are_retained() {
        let mut store = ObservationStore::new();
        store.append(vec![obs("01646500", 5, None)], day(), fixed_now());
        assert_eq!(store.len(), 1);
        assert_eq!(store.series("01646500")[0].flow, None);
    }

    // --- Retention ----------------------------------------------------------

    #[test]
    fn test_append_evicts_records_older_than_retention() {
        let mut store = ObservationStore::from_observations(vec![
            obs("01646500", 25 * 60, Some(1.0)),
            obs("01646500", 23 * 60, Some(2.0)),
            obs("02035000", 26 * 60, Some(3.0)),
        ]);
        let outcome = store.append(vec![obs("01646500", 5, Some(4.0))], day(), fixed_now());

        assert_eq!(
            outcome,
            AppendOutcome::Appended {
                added: 1,
                duplicates: 0,
                evicted: 2,
                retained: 2
            }
        );
        let cutoff = fixed_now() - day();
        assert!(store.observations().all(|o| o.timestamp >= cutoff));
        // A gauge whose readings all aged out disappears from the window.
        assert!(store.series("02035000").is_empty());
        assert_eq!(store.entity_ids().collect::<Vec<_>>(), vec!["01646500"]);
    }

    #[test]
    fn test_record_exactly_at_cutoff_is_kept() {
        let mut store = ObservationStore::new();
        store.append(vec![obs("01646500", 24 * 60, Some(1.0))], day(), fixed_now());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_series_is_sorted_ascending_regardless_of_input_order() {
        let store = ObservationStore::from_observations(vec![
            obs("01646500", 5, Some(3.0)),
            obs("01646500", 15, Some(1.0)),
            obs("01646500", 10, Some(2.0)),
        ]);
        let flows: Vec<_> = store.series("01646500").iter().map(|o| o.flow).collect();
        assert_eq!(flows, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }
}
