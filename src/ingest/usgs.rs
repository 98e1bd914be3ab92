/// USGS NWIS Water Services client
///
/// Retrieves statewide discharge (parameter 00060) for active stream gauges:
/// instantaneous values (IV, ~5-minute cadence) for the rolling window, and
/// daily values (DV) for the long-horizon baseline history.
///
/// API Documentation: https://waterservices.usgs.gov/docs/
/// IV endpoint: https://waterservices.usgs.gov/nwis/iv/
/// DV endpoint: https://waterservices.usgs.gov/nwis/dv/

use crate::config::FetchConfig;
use crate::ingest::{DailyHistorySource, ObservationSource};
use crate::logging::{self, Stage};
use crate::model::{DailyValue, NwisError, Observation, PARAM_DISCHARGE, parse_flow};
use crate::sites::is_valid_site_code;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::time::Duration;

pub const NWIS_IV_URL: &str = "https://waterservices.usgs.gov/nwis/iv/";
pub const NWIS_DV_URL: &str = "https://waterservices.usgs.gov/nwis/dv/";

// ============================================================================
// NWIS JSON Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct NwisResponse {
    #[serde(default)]
    value: Option<NwisValue>,
}

#[derive(Debug, Deserialize)]
struct NwisValue {
    #[serde(rename = "timeSeries", default)]
    time_series: Vec<TimeSeries>,
}

#[derive(Debug, Deserialize)]
struct TimeSeries {
    #[serde(rename = "sourceInfo")]
    source_info: SourceInfo,
    #[serde(default)]
    values: Vec<ValueSet>,
}

#[derive(Debug, Deserialize)]
struct SourceInfo {
    #[serde(rename = "siteName")]
    site_name: Option<String>,
    #[serde(rename = "siteCode")]
    site_code: Vec<SiteCode>,
    #[serde(rename = "geoLocation")]
    geo_location: Option<GeoLocation>,
}

#[derive(Debug, Deserialize)]
struct SiteCode {
    value: String,
}

#[derive(Debug, Deserialize)]
struct GeoLocation {
    #[serde(rename = "geogLocation")]
    geog_location: GeogLocation,
}

#[derive(Debug, Deserialize)]
struct GeogLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ValueSet {
    #[serde(default)]
    value: Vec<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    value: Option<String>,
    #[serde(rename = "dateTime")]
    date_time: String,
}

/// Site-level fields shared by every value of one time series.
struct SeriesHeader {
    site_code: String,
    site_name: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

fn decode(body: &str) -> Result<Vec<TimeSeries>, NwisError> {
    let response: NwisResponse =
        serde_json::from_str(body).map_err(|e| NwisError::ParseError(e.to_string()))?;
    Ok(response.value.map(|v| v.time_series).unwrap_or_default())
}

fn header(ts: &TimeSeries) -> Option<SeriesHeader> {
    let site_code = ts.source_info.site_code.first()?.value.clone();
    if !is_valid_site_code(&site_code) {
        logging::warn(
            Stage::Usgs,
            Some(&site_code),
            "site code does not look like a USGS site number",
        );
    }
    let geog = ts.source_info.geo_location.as_ref().map(|g| &g.geog_location);
    Some(SeriesHeader {
        site_code,
        site_name: ts.source_info.site_name.clone(),
        latitude: geog.and_then(|g| g.latitude),
        longitude: geog.and_then(|g| g.longitude),
    })
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Parses an IV response into observations.
///
/// Values that are not numbers ("Ice", "Eqp", empty, the -999999 sentinel)
/// become `flow: None`; the reading itself is kept. Readings whose
/// `dateTime` cannot be parsed are dropped with a warning.
pub fn parse_iv_response(body: &str) -> Result<Vec<Observation>, NwisError> {
    let mut observations = Vec::new();

    for ts in decode(body)? {
        let Some(site) = header(&ts) else {
            continue;
        };
        let Some(values) = ts.values.first() else {
            continue;
        };
        for raw in &values.value {
            let timestamp = match DateTime::parse_from_rfc3339(&raw.date_time) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    logging::warn(
                        Stage::Usgs,
                        Some(&site.site_code),
                        &format!("dropping reading with bad dateTime '{}': {}", raw.date_time, e),
                    );
                    continue;
                }
            };
            observations.push(Observation {
                entity_id: site.site_code.clone(),
                entity_name: site.site_name.clone(),
                timestamp,
                flow: raw.value.as_deref().and_then(parse_flow),
                latitude: site.latitude,
                longitude: site.longitude,
            });
        }
    }

    Ok(observations)
}

/// Parses a DV response into daily values.
///
/// Unlike IV readings, a daily value without a usable number carries no
/// information for the percentile and is dropped.
pub fn parse_dv_response(body: &str) -> Result<Vec<DailyValue>, NwisError> {
    let mut daily = Vec::new();

    for ts in decode(body)? {
        let Some(site) = header(&ts) else {
            continue;
        };
        let Some(values) = ts.values.first() else {
            continue;
        };
        for raw in &values.value {
            let Some(flow) = raw.value.as_deref().and_then(parse_flow) else {
                continue;
            };
            let Some(date) = raw
                .date_time
                .get(..10)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            daily.push(DailyValue {
                entity_id: site.site_code.clone(),
                entity_name: site.site_name.clone(),
                date,
                flow: Some(flow),
                latitude: site.latitude,
            });
        }
    }

    Ok(daily)
}

// ============================================================================
// URL Construction
// ============================================================================

fn build_url(base: &str, state_code: &str, start: &str, end: &str) -> String {
    let params = [
        ("format", "json"),
        ("stateCd", state_code),
        ("parameterCd", PARAM_DISCHARGE),
        ("siteType", "ST"),
        ("siteStatus", "active"),
        ("startDT", start),
        ("endDT", end),
    ];
    match reqwest::Url::parse_with_params(base, &params) {
        Ok(url) => url.to_string(),
        Err(_) => {
            let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            format!("{}?{}", base, query.join("&"))
        }
    }
}

/// IV URL for every active stream gauge in `state_code` between two UTC
/// instants (minute precision, explicit UTC offset).
pub fn build_iv_url(state_code: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let fmt = "%Y-%m-%dT%H:%M%:z";
    build_url(
        NWIS_IV_URL,
        state_code,
        &start.format(fmt).to_string(),
        &end.format(fmt).to_string(),
    )
}

/// DV URL for every active stream gauge in `state_code` between two dates.
pub fn build_dv_url(state_code: &str, start: NaiveDate, end: NaiveDate) -> String {
    build_url(
        NWIS_DV_URL,
        state_code,
        &start.format("%Y-%m-%d").to_string(),
        &end.format("%Y-%m-%d").to_string(),
    )
}

// ============================================================================
// API Client
// ============================================================================

/// Blocking NWIS client with bounded timeouts and IV retries.
pub struct NwisClient {
    http: reqwest::blocking::Client,
    state_code: String,
    iv_timeout: Duration,
    dv_timeout: Duration,
    retries: u32,
    retry_delay: Duration,
}

impl NwisClient {
    pub fn new(state_code: &str, fetch: &FetchConfig) -> Result<Self, NwisError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("vaflow_service/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NwisError::RequestFailed(e.to_string()))?;
        Ok(Self {
            http,
            state_code: state_code.to_string(),
            iv_timeout: Duration::from_secs(fetch.iv_timeout_secs),
            dv_timeout: Duration::from_secs(fetch.dv_timeout_secs),
            retries: fetch.retries,
            retry_delay: Duration::from_millis(fetch.retry_delay_ms),
        })
    }

    fn get_text(&self, url: &str, timeout: Duration) -> Result<String, NwisError> {
        logging::debug(Stage::Usgs, None, &format!("GET {}", url));
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .timeout(timeout)
            .send()
            .map_err(|e| NwisError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NwisError::HttpError(status.as_u16()));
        }
        response
            .text()
            .map_err(|e| NwisError::RequestFailed(e.to_string()))
    }
}

impl ObservationSource for NwisClient {
    fn fetch_observations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, NwisError> {
        let url = build_iv_url(&self.state_code, start, end);
        let mut attempt = 0;
        loop {
            let result = self
                .get_text(&url, self.iv_timeout)
                .and_then(|body| parse_iv_response(&body));
            match result {
                Ok(observations) => {
                    logging::info(
                        Stage::Usgs,
                        None,
                        &format!("Fetched {} readings total.", observations.len()),
                    );
                    return Ok(observations);
                }
                // A 4xx will not improve on retry.
                Err(NwisError::HttpError(code)) if (400..500).contains(&code) => {
                    return Err(NwisError::HttpError(code));
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    logging::warn(
                        Stage::Usgs,
                        None,
                        &format!("IV fetch attempt {} failed: {}; retrying", attempt, e),
                    );
                    std::thread::sleep(self.retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl DailyHistorySource for NwisClient {
    fn fetch_daily(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyValue>, NwisError> {
        let url = build_dv_url(&self.state_code, start, end);
        let body = self.get_text(&url, self.dv_timeout)?;
        parse_dv_response(&body)
    }
}

// ============================================================================
// Tests
// ============================================================================
