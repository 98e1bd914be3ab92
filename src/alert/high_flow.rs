//! The named list of gauges currently at or above their P90 baseline.

use crate::logging::{self, Stage};
use crate::model::{ComparisonResult, Region};

/// A gauge flagged as high flow in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct HighFlowSite {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub ratio: f64,
    pub region: Option<Region>,
}

/// Gauges with `high_flow = true`, in the order of `rows`.
pub fn collect_high_flow(rows: &[ComparisonResult]) -> Vec<HighFlowSite> {
    rows.iter()
        .filter(|row| row.high_flow)
        .filter_map(|row| {
            Some(HighFlowSite {
                entity_id: row.current.entity_id.clone(),
                entity_name: row.current.entity_name.clone(),
                ratio: row.ratio?,
                region: row.region,
            })
        })
        .collect()
}

/// Log the high-flow list, or that there are no such sites.
pub fn log_high_flow_sites(sites: &[HighFlowSite]) {
    if sites.is_empty() {
        logging::info(Stage::Compare, None, "No sites above 90th percentile today.");
        return;
    }

    logging::warn(
        Stage::Compare,
        None,
        &format!("High flow sites detected: {}", sites.len()),
    );
    for site in sites {
        let name = site.entity_name.as_deref().unwrap_or("unknown");
        logging::warn(
            Stage::Compare,
            Some(&site.entity_id),
            &format!("{}: {} ({:.2}x P90)", site.entity_id, name, site.ratio),
        );
    }
}
