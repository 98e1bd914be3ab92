//! Short-horizon percent change in flow.
//!
//! Lookbacks are sample counts, not wall-clock spans: "1h" means 12 rows
//! earlier in the same gauge's sorted series, which is one hour only while
//! the gauge reports every 5 minutes. When a cadence tolerance is set, a
//! value whose real elapsed time strays from the label's nominal duration by
//! more than the tolerance is nulled instead of reported under a wrong label.

use crate::config::Config;
use crate::logging::{self, Stage};
use crate::model::{Lookback, Observation, RateOfChangeResult};
use crate::store::window::ObservationStore;
use chrono::Duration;
use std::collections::BTreeMap;

/// `(current − earlier) / earlier × 100`, or `None` when either side is
/// missing, the earlier value is zero, or the result is not finite.
pub fn percent_change(current: Option<f64>, earlier: Option<f64>) -> Option<f64> {
    let (current, earlier) = (current?, earlier?);
    if earlier == 0.0 {
        return None;
    }
    let pct = (current - earlier) / earlier * 100.0;
    pct.is_finite().then_some(pct)
}

#[derive(Debug, Clone)]
pub struct RateOfChangeEngine {
    lookbacks: Vec<Lookback>,
    cadence_tolerance: Option<Duration>,
}

impl RateOfChangeEngine {
    pub fn new(lookbacks: Vec<Lookback>, cadence_tolerance: Option<Duration>) -> Self {
        Self {
            lookbacks,
            cadence_tolerance,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.lookbacks(), config.cadence_tolerance())
    }

    pub fn lookbacks(&self) -> &[Lookback] {
        &self.lookbacks
    }

    /// Percent change at row `index` of an ascending series.
    fn pct_at(&self, series: &[&Observation], index: usize, lookback: &Lookback) -> Option<f64> {
        let earlier_index = index.checked_sub(lookback.samples)?;
        let current = series[index];
        let earlier = series[earlier_index];

        if let Some(tolerance) = self.cadence_tolerance {
            let elapsed = current.timestamp - earlier.timestamp;
            let drift = elapsed
                .num_seconds()
                .saturating_sub(lookback.nominal_minutes.saturating_mul(60))
                .saturating_abs();
            if drift > tolerance.num_seconds() {
                logging::debug(
                    Stage::RateOfChange,
                    Some(&current.entity_id),
                    &format!(
                        "pct_change_{} nulled: {} samples span {} min, expected {} min",
                        lookback.label,
                        lookback.samples,
                        elapsed.num_minutes(),
                        lookback.nominal_minutes
                    ),
                );
                return None;
            }
        }

        percent_change(current.flow, earlier.flow)
    }

    /// Percent change for every row of one gauge's ascending series.
    pub fn series_pct_change(&self, series: &[&Observation], lookback: &Lookback) -> Vec<Option<f64>> {
        (0..series.len())
            .map(|i| self.pct_at(series, i, lookback))
            .collect()
    }

    /// Result row for the newest observation of an ascending series.
    pub fn latest_for_series(&self, series: &[&Observation]) -> Option<RateOfChangeResult> {
        let last_index = series.len().checked_sub(1)?;
        let latest = series[last_index];

        let pct_change: BTreeMap<String, Option<f64>> = self
            .lookbacks
            .iter()
            .map(|lb| (lb.label.clone(), self.pct_at(series, last_index, lb)))
            .collect();

        Some(RateOfChangeResult {
            entity_id: latest.entity_id.clone(),
            entity_name: latest.entity_name.clone(),
            timestamp: latest.timestamp,
            flow: latest.flow,
            pct_change,
        })
    }

    /// One result per gauge in the window, ordered by gauge id.
    pub fn latest_per_entity(&self, store: &ObservationStore) -> Vec<RateOfChangeResult> {
        let results: Vec<RateOfChangeResult> = store
            .iter_series()
            .filter_map(|(_, series)| self.latest_for_series(&series))
            .collect();

        let short = results
            .iter()
            .filter(|r| r.pct_change.values().any(Option::is_none))
            .count();
        logging::info(
            Stage::RateOfChange,
            None,
            &format!(
                "Computed rate of change for {} sites ({} with at least one undefined lookback)",
                results.len(),
                short
            ),
        );
        results
    }

    /// Same as `latest_per_entity` for rows in arbitrary order; they are
    /// deduplicated (first wins) and sorted first.
    pub fn compute(&self, observations: Vec<Observation>) -> Vec<RateOfChangeResult> {
        self.latest_per_entity(&ObservationStore::from_observations(observations))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    /// A regular 5-minute series for one gauge.
    fn series(site: &str, flows: &[Option<f64>]) -> Vec<Observation> {
        flows
            .iter()
            .enumerate()
            .map(|(i, flow)| Observation {
                entity_id: site.to_string(),
                entity_name: Some(format!("Gauge {}", site)),
                timestamp: start() + Duration::minutes(5 * i as i64),
                flow: *flow,
                latitude: None,
                longitude: None,
            })
            .collect()
    }

    fn engine() -> RateOfChangeEngine {
        RateOfChangeEngine::new(Lookback::defaults(), Some(Duration::minutes(5)))
    }

    #[test]
    fn test_percent_change_edge_cases() {
        assert_eq!(percent_change(Some(15.0), Some(10.0)), Some(50.0));
        assert_eq!(percent_change(Some(5.0), Some(10.0)), Some(-50.0));
        assert_eq!(percent_change(Some(15.0), Some(0.0)), None);
        assert_eq!(percent_change(Some(15.0), None), None);
        assert_eq!(percent_change(None, Some(10.0)), None);
    }

    #[test]
    fn test_seventy_two_tens_then_fifteen_is_fifty_percent() {
        let mut flows = vec![Some(10.0); 72];
        flows.push(Some(15.0));
        let results = engine().compute(series("X1", &flows));

        assert_eq!(results.len(), 1);
        let latest = &results[0];
        assert_eq!(latest.entity_id, "X1");
        assert_eq!(latest.flow, Some(15.0));
        assert_eq!(latest.timestamp, start() + Duration::minutes(5 * 72));
        assert_eq!(latest.pct("1h"), Some(50.0));
        assert_eq!(latest.pct("3h"), Some(50.0));
        assert_eq!(latest.pct("6h"), Some(50.0));
    }

    #[test]
    fn test_insufficient_history_is_null_not_zero() {
        // 20 samples: enough for 1h (12) but not 3h (36) or 6h (72).
        let flows: Vec<_> = (0..20).map(|i| Some(100.0 + i as f64)).collect();
        let results = engine().compute(series("X1", &flows));
        let latest = &results[0];
        assert_eq!(latest.pct("1h"), percent_change(Some(119.0), Some(107.0)));
        assert_eq!(latest.pct_change.get("3h"), Some(&None));
        assert_eq!(latest.pct_change.get("6h"), Some(&None));
    }

    #[test]
    fn test_zero_or_null_earlier_flow_is_null() {
        let mut flows = vec![Some(0.0)];
        flows.extend(vec![Some(5.0); 12]);
        let results = engine().compute(series("X1", &flows));
        assert_eq!(results[0].pct("1h"), None);

        let mut flows = vec![None];
        flows.extend(vec![Some(5.0); 12]);
        let results = engine().compute(series("X1", &flows));
        assert_eq!(results[0].pct("1h"), None);
    }

    #[test]
    fn test_every_row_gets_a_value_once_history_allows() {
        let flows: Vec<_> = (0..15).map(|i| Some(10.0 + i as f64)).collect();
        let obs = series("X1", &flows);
        let refs: Vec<&Observation> = obs.iter().collect();
        let lookback = Lookback::new("1h", 12, 60);
        let values = engine().series_pct_change(&refs, &lookback);

        assert_eq!(values.len(), 15);
        assert!(values[..12].iter().all(Option::is_none));
        assert_eq!(values[12], percent_change(Some(22.0), Some(10.0)));
        assert_eq!(values[14], percent_change(Some(24.0), Some(12.0)));
    }

    #[test]
    fn test_gap_in_cadence_nulls_mislabelled_lookback() {
        // Twelve samples back spans 90 minutes because of a 30-minute outage.
        let mut obs = series("X1", &vec![Some(10.0); 13]);
        for o in obs.iter_mut().skip(6) {
            o.timestamp += Duration::minutes(30);
        }
        let results = engine().compute(obs.clone());
        assert_eq!(results[0].pct("1h"), None);

        // Without the tolerance check the sample-count value is reported.
        let lenient = RateOfChangeEngine::new(Lookback::defaults(), None);
        assert_eq!(lenient.compute(obs)[0].pct("1h"), Some(0.0));
    }

    #[test]
    fn test_extreme_nominal_span_is_nulled_not_overflowed() {
        let obs = series("X1", &vec![Some(10.0); 13]);
        let refs: Vec<&Observation> = obs.iter().collect();
        for minutes in [i64::MAX, i64::MIN] {
            let lookback = Lookback::new("far", 12, minutes);
            let values = engine().series_pct_change(&refs, &lookback);
            assert_eq!(values[12], None);
        }
    }

    #[test]
    fn test_one_row_per_entity_at_latest_timestamp() {
        let mut rows = series("02037500", &[Some(1.0), Some(2.0), Some(3.0)]);
        rows.extend(series("01646500", &[Some(7.0), Some(8.0)]));
        rows.reverse();

        let results = engine().compute(rows);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entity_id, "01646500");
        assert_eq!(results[0].flow, Some(8.0));
        assert_eq!(results[1].entity_id, "02037500");
        assert_eq!(results[1].flow, Some(3.0));
        assert_eq!(results[1].timestamp, start() + Duration::minutes(10));
    }

    #[test]
    fn test_computation_is_bit_for_bit_deterministic() {
        let flows: Vec<_> = (0..80).map(|i| Some(1.0 + (i as f64) / 7.0)).collect();
        let first = engine().compute(series("X1", &flows));
        let second = engine().compute(series("X1", &flows));
        let bits = |r: &RateOfChangeResult| r.pct("1h").map(f64::to_bits);
        assert_eq!(bits(&first[0]), bits(&second[0]));
        assert_eq!(first, second);
    }

    #[test]
    fn test_null_latest_flow_yields_null_changes() {
        let mut flows = vec![Some(10.0); 72];
        flows.push(None);
        let results = engine().compute(series("X1", &flows));
        assert_eq!(results[0].flow, None);
        assert!(results[0].pct_change.values().all(Option::is_none));
    }
}
