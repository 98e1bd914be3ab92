//! Current flow against the day-of-year P90 baseline.
//!
//! A left join: every gauge in the current snapshot comes out exactly once,
//! whether or not the baseline has an entry for it. Missing baseline values
//! propagate as `None` ratio and `high_flow = false`; nothing is dropped and
//! nothing is fabricated.

use crate::alert::high_flow::{self, HighFlowSite};
use crate::analysis::baseline::BaselineIndex;
use crate::logging::{self, Stage};
use crate::model::{ComparisonResult, RateOfChangeResult, Region};
use crate::sites::SiteCatalog;

/// `flow / p90_flow`, undefined when either side is missing or the baseline
/// is zero.
pub fn flow_ratio(flow: Option<f64>, p90_flow: Option<f64>) -> Option<f64> {
    let (flow, p90) = (flow?, p90_flow?);
    if p90 == 0.0 {
        return None;
    }
    let ratio = flow / p90;
    ratio.is_finite().then_some(ratio)
}

/// High flow means at or above the P90 baseline.
pub fn is_high_flow(ratio: Option<f64>) -> bool {
    ratio.is_some_and(|r| r >= 1.0)
}

/// Output of one comparison pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    pub rows: Vec<ComparisonResult>,
    pub high_flow: Vec<HighFlowSite>,
    /// Gauges that had no baseline entry for the current day-of-year.
    pub missing_baseline: usize,
}

pub struct PercentileComparator<'a> {
    baseline: Option<&'a BaselineIndex>,
    sites: &'a SiteCatalog,
    latitude_midpoint: f64,
}

impl<'a> PercentileComparator<'a> {
    /// `baseline` is `None` when no baseline is available this run; every
    /// row then carries null P90 fields.
    pub fn new(
        baseline: Option<&'a BaselineIndex>,
        sites: &'a SiteCatalog,
        latitude_midpoint: f64,
    ) -> Self {
        Self {
            baseline,
            sites,
            latitude_midpoint,
        }
    }

    /// Region from the baseline's build-time label, else from the gauge's
    /// current coordinates.
    fn region_for(&self, entity_id: &str) -> Option<Region> {
        self.baseline
            .and_then(|b| b.region_of(entity_id))
            .or_else(|| {
                self.sites
                    .find(entity_id)
                    .and_then(|s| s.region(self.latitude_midpoint))
            })
    }

    pub fn compare_one(&self, current: &RateOfChangeResult) -> ComparisonResult {
        let day_of_year = crate::model::day_of_year(current.timestamp);
        let entry = self
            .baseline
            .and_then(|b| b.lookup(&current.entity_id, day_of_year));

        let p90_flow = entry.map(|e| e.p90_flow);
        let ratio = flow_ratio(current.flow, p90_flow);

        let mut current = current.clone();
        if current.entity_name.is_none() {
            current.entity_name = entry.and_then(|e| e.entity_name.clone());
        }

        ComparisonResult {
            region: entry
                .and_then(|e| e.region)
                .or_else(|| self.region_for(&current.entity_id)),
            current,
            p90_flow,
            ratio,
            high_flow: is_high_flow(ratio),
        }
    }

    /// Joins every current row against the baseline and logs the high-flow
    /// list.
    pub fn compare(&self, current: &[RateOfChangeResult]) -> ComparisonReport {
        let rows: Vec<ComparisonResult> = current.iter().map(|r| self.compare_one(r)).collect();
        let missing_baseline = rows.iter().filter(|r| r.p90_flow.is_none()).count();

        if missing_baseline > 0 && self.baseline.is_some() {
            logging::warn(
                Stage::Compare,
                None,
                &format!(
                    "{} of {} sites have no P90 entry for today's day-of-year",
                    missing_baseline,
                    rows.len()
                ),
            );
        }

        let high_flow = high_flow::collect_high_flow(&rows);
        high_flow::log_high_flow_sites(&high_flow);

        ComparisonReport {
            rows,
            high_flow,
            missing_baseline,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
