/// Site catalog for the Virginia gauge network.
///
/// Unlike a fixed basin, the statewide network is discovered from the data:
/// every gauge that reports discharge shows up in the IV response with its
/// name and coordinates. The catalog collects that static metadata once per
/// run so later stages (region labels, processed output coordinates) can
/// look it up by site code instead of re-scanning observations.

use crate::model::{Observation, Region};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Site metadata
// ---------------------------------------------------------------------------

/// Static metadata for a single gauge.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    /// USGS site number (8 to 15 digits for real gauges).
    pub site_code: String,
    /// Official USGS site name, when the upstream source supplied one.
    pub name: Option<String>,
    /// WGS84 latitude.
    pub latitude: Option<f64>,
    /// WGS84 longitude.
    pub longitude: Option<f64>,
}

impl Site {
    /// North/south label from latitude; `None` without coordinates.
    pub fn region(&self, latitude_midpoint: f64) -> Option<Region> {
        self.latitude
            .map(|lat| Region::from_latitude(lat, latitude_midpoint))
    }
}

/// All gauges seen in the current window, keyed by site code.
#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    sites: BTreeMap<String, Site>,
}

impl SiteCatalog {
    /// Builds the catalog from observations. Metadata is static per gauge,
    /// so the first non-empty value seen for each field is kept and later
    /// rows only fill gaps.
    pub fn from_observations<'a, I>(observations: I) -> Self
    where
        I: IntoIterator<Item = &'a Observation>,
    {
        let mut sites: BTreeMap<String, Site> = BTreeMap::new();
        for obs in observations {
            let site = sites.entry(obs.entity_id.clone()).or_insert_with(|| Site {
                site_code: obs.entity_id.clone(),
                name: None,
                latitude: None,
                longitude: None,
            });
            if site.name.is_none() {
                site.name = obs.entity_name.clone();
            }
            if site.latitude.is_none() {
                site.latitude = obs.latitude;
            }
            if site.longitude.is_none() {
                site.longitude = obs.longitude;
            }
        }
        Self { sites }
    }

    /// Looks up a gauge by site code. Returns `None` if not found.
    pub fn find(&self, site_code: &str) -> Option<&Site> {
        self.sites.get(site_code)
    }

    /// Gauges in one region.
    pub fn sites_in_region(&self, region: Region, latitude_midpoint: f64) -> Vec<&Site> {
        self.sites
            .values()
            .filter(|s| s.region(latitude_midpoint) == Some(region))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// USGS site numbers are 8 to 15 ASCII digits. Anything else will be
/// silently ignored by the NWIS services.
pub fn is_valid_site_code(code: &str) -> bool {
    (8..=15).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
