/// Service configuration.
///
/// Read from a TOML file (`vaflow.toml` by default, or the path in
/// `VAFLOW_CONFIG`). Every field has a default, so a missing file is not an
/// error. A handful of environment variables, optionally loaded from `.env`,
/// override the file for deployment-specific values.

use crate::logging::LogLevel;
use crate::model::{Lookback, PipelineError};
use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "vaflow.toml";

/// Upper bounds enforced by `validate`. They keep every derived
/// `chrono::Duration` and the lookback second counts in range.
pub const MAX_RETENTION_HOURS: i64 = 24 * 366;
pub const MAX_HISTORY_YEARS: i64 = 200;
pub const MAX_LOOKBACK_MINUTES: i64 = 7 * 24 * 60;
pub const MAX_CADENCE_TOLERANCE_MINUTES: i64 = 24 * 60;

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the window, baseline and output tables.
    pub data_dir: PathBuf,
    /// Two-letter state code passed to NWIS.
    pub state_code: String,
    /// Trailing span of observations kept in the rolling window.
    pub retention_hours: i64,
    /// Gauges at or above this latitude are labelled "north".
    pub latitude_midpoint: f64,
    pub fetch: FetchConfig,
    pub rate_of_change: RateOfChangeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub iv_timeout_secs: u64,
    pub dv_timeout_secs: u64,
    /// Additional attempts after a failed IV fetch.
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub history_years: i64,
    pub chunk_years: i64,
    /// Pause between history chunks, to stay polite to the USGS servers.
    pub chunk_pause_ms: u64,
    /// Rebuild the baseline automatically when the table is missing.
    pub auto_rebuild_baseline: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateOfChangeConfig {
    /// Maximum allowed gap between a lookback's nominal and actual elapsed
    /// time. Zero disables the check.
    pub cadence_tolerance_minutes: Option<i64>,
    pub lookbacks: Vec<LookbackConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LookbackConfig {
    pub label: String,
    pub samples: usize,
    pub minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub console_timestamps: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            state_code: "VA".to_string(),
            retention_hours: 24,
            latitude_midpoint: 37.5,
            fetch: FetchConfig::default(),
            rate_of_change: RateOfChangeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            iv_timeout_secs: 30,
            dv_timeout_secs: 60,
            retries: 2,
            retry_delay_ms: 2_000,
            history_years: 20,
            chunk_years: 5,
            chunk_pause_ms: 1_000,
            auto_rebuild_baseline: true,
        }
    }
}

impl Default for RateOfChangeConfig {
    fn default() -> Self {
        Self {
            cadence_tolerance_minutes: Some(5),
            lookbacks: Lookback::defaults()
                .into_iter()
                .map(|l| LookbackConfig {
                    label: l.label,
                    samples: l.samples,
                    minutes: l.nominal_minutes,
                })
                .collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            console_timestamps: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Config, PipelineError> {
        let config: Config =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Config, PipelineError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Config::from_toml_str(&text)
    }

    /// Resolves the config path (explicit argument, `VAFLOW_CONFIG`, or the
    /// default file name), loads it, and applies environment overrides.
    ///
    /// Reads `.env` first if one is present.
    pub fn from_env(explicit: Option<&Path>) -> Result<Config, PipelineError> {
        dotenv::dotenv().ok();
        let lookup = |key: &str| std::env::var(key).ok();

        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| lookup("VAFLOW_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = Config::load(&path)?;
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    /// Applies `VAFLOW_DATA_DIR`, `VAFLOW_LOG_LEVEL` and `VAFLOW_LOG_FILE`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("VAFLOW_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("VAFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(file) = lookup("VAFLOW_LOG_FILE") {
            self.logging.file = Some(file);
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if !(1..=MAX_RETENTION_HOURS).contains(&self.retention_hours) {
            return Err(PipelineError::Config(format!(
                "retention_hours must be between 1 and {}",
                MAX_RETENTION_HOURS
            )));
        }
        if !(1..=MAX_HISTORY_YEARS).contains(&self.fetch.history_years)
            || !(1..=self.fetch.history_years).contains(&self.fetch.chunk_years)
        {
            return Err(PipelineError::Config(format!(
                "history_years must be between 1 and {} and chunk_years between 1 and history_years",
                MAX_HISTORY_YEARS
            )));
        }
        if let Some(minutes) = self.rate_of_change.cadence_tolerance_minutes {
            if !(0..=MAX_CADENCE_TOLERANCE_MINUTES).contains(&minutes) {
                return Err(PipelineError::Config(format!(
                    "cadence_tolerance_minutes must be between 0 and {}",
                    MAX_CADENCE_TOLERANCE_MINUTES
                )));
            }
        }
        if self.rate_of_change.lookbacks.is_empty() {
            return Err(PipelineError::Config(
                "at least one lookback must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for lookback in &self.rate_of_change.lookbacks {
            if lookback.samples == 0 {
                return Err(PipelineError::Config(format!(
                    "lookback '{}' must span at least one sample",
                    lookback.label
                )));
            }
            if !(1..=MAX_LOOKBACK_MINUTES).contains(&lookback.minutes) {
                return Err(PipelineError::Config(format!(
                    "lookback '{}' minutes must be between 1 and {}",
                    lookback.label, MAX_LOOKBACK_MINUTES
                )));
            }
            if !seen.insert(lookback.label.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate lookback label '{}'",
                    lookback.label
                )));
            }
        }
        self.log_level()?;
        Ok(())
    }

    /// Retention as a duration. Out-of-range values (only reachable by
    /// bypassing `validate`) are clamped into range.
    pub fn retention(&self) -> Duration {
        Duration::try_hours(self.retention_hours.clamp(1, MAX_RETENTION_HOURS))
            .unwrap_or(Duration::zero())
    }

    pub fn log_level(&self) -> Result<LogLevel, PipelineError> {
        self.logging.level.parse().map_err(PipelineError::Config)
    }

    pub fn lookbacks(&self) -> Vec<Lookback> {
        self.rate_of_change
            .lookbacks
            .iter()
            .map(|l| Lookback::new(&l.label, l.samples, l.minutes))
            .collect()
    }

    pub fn cadence_tolerance(&self) -> Option<Duration> {
        self.rate_of_change
            .cadence_tolerance_minutes
            .filter(|m| *m > 0)
            .and_then(|m| Duration::try_minutes(m.min(MAX_CADENCE_TOLERANCE_MINUTES)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_toml_str("").expect("empty config is valid");
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.retention_hours, 24);
        assert_eq!(config.latitude_midpoint, 37.5);
        assert_eq!(config.fetch.history_years, 20);
        assert_eq!(config.lookbacks(), Lookback::defaults());
        assert_eq!(config.cadence_tolerance(), Some(Duration::minutes(5)));
    }

    #[test]
    fn test_partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml_str(
            r#"
            data_dir = "/var/lib/vaflow"
            retention_hours = 48

            [fetch]
            retries = 0

            [rate_of_change]
            cadence_tolerance_minutes = 10
            lookbacks = [{ label = "30m", samples = 6, minutes = 30 }]
            "#,
        )
        .expect("valid config");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/vaflow"));
        assert_eq!(config.retention(), Duration::hours(48));
        assert_eq!(config.fetch.retries, 0);
        assert_eq!(config.fetch.iv_timeout_secs, 30);
        assert_eq!(config.lookbacks(), vec![Lookback::new("30m", 6, 30)]);
        assert_eq!(config.cadence_tolerance(), Some(Duration::minutes(10)));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_tolerance_disables_cadence_check() {
        let config =
            Config::from_toml_str("[rate_of_change]\ncadence_tolerance_minutes = 0").unwrap();
        assert_eq!(config.cadence_tolerance(), None);
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        for doc in [
            "retention_hours = 3000000000000000",
            "retention_hours = 8785",
            "[fetch]\nhistory_years = 100000000000000000",
            "[fetch]\nhistory_years = 5\nchunk_years = 6",
            "[fetch]\nchunk_years = -1",
            "[rate_of_change]\ncadence_tolerance_minutes = 9000000000000000000",
            "[rate_of_change]\ncadence_tolerance_minutes = -5",
            "[rate_of_change]\nlookbacks = [{ label = \"1h\", samples = 12, minutes = -60 }]",
            "[rate_of_change]\nlookbacks = [{ label = \"1h\", samples = 12, minutes = 9000000000000000000 }]",
        ] {
            let result = Config::from_toml_str(doc);
            assert!(
                matches!(result, Err(PipelineError::Config(_))),
                "accepted out-of-range config: {}",
                doc
            );
        }
        let widest = Config::from_toml_str("retention_hours = 8784\n[fetch]\nhistory_years = 200")
            .expect("bounds are inclusive");
        assert_eq!(widest.retention(), Duration::hours(8784));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = Config::from_toml_str("retention = 24").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_toml_str("retention_hours = 0").is_err());
        assert!(Config::from_toml_str("[logging]\nlevel = \"loud\"").is_err());
        assert!(Config::from_toml_str(
            "[rate_of_change]\nlookbacks = [{ label = \"1h\", samples = 0, minutes = 60 }]"
        )
        .is_err());
        assert!(Config::from_toml_str(
            "[rate_of_change]\nlookbacks = [\
             { label = \"1h\", samples = 12, minutes = 60 },\
             { label = \"1h\", samples = 24, minutes = 120 }]"
        )
        .is_err());
    }

    #[test]
    fn test_environment_overrides_win_over_file() {
        let env: HashMap<&str, &str> = [
            ("VAFLOW_DATA_DIR", "/tmp/vaflow"),
            ("VAFLOW_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides are valid");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/vaflow"));
        assert_eq!(config.log_level().unwrap(), LogLevel::Debug);
        assert_eq!(config.logging.file, None);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/vaflow.toml")).expect("defaults");
        assert_eq!(config.state_code, "VA");
    }
}
