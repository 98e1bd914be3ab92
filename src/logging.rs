/// Structured logging for the streamflow pipeline
///
/// Provides context-rich logging tagged with the pipeline stage and an
/// optional gauge identifier. Supports both console output and file-based
/// logging for scheduled (cron) runs.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Usgs,
    Window,
    RateOfChange,
    Baseline,
    Compare,
    System,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Usgs => write!(f, "USGS"),
            Stage::Window => write!(f, "WINDOW"),
            Stage::RateOfChange => write!(f, "ROC"),
            Stage::Baseline => write!(f, "BASELINE"),
            Stage::Compare => write!(f, "COMPARE"),
            Stage::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the service had nothing for the requested range
    Expected,
    /// Unexpected failure - indicates service degradation or an API change
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>, console_timestamps: bool) {
        let logger = Logger {
            min_level,
            log_file,
            console_timestamps,
        };

        if let Ok(mut slot) = LOGGER.lock() {
            *slot = Some(logger);
        }
    }

    fn log(&self, level: LogLevel, stage: Stage, site_id: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let site_part = site_id.map(|s| format!(" [{}]", s)).unwrap_or_default();
        let log_entry = format_entry(level, stage, site_id, message);

        if self.console_timestamps {
            match level {
                LogLevel::Error | LogLevel::Warning => eprintln!("{}", log_entry),
                LogLevel::Info | LogLevel::Debug => println!("{}", log_entry),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}{}: {}", stage, site_part, message),
                LogLevel::Warning => eprintln!("   ⚠ {}{}: {}", stage, site_part, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}{}: {}", stage, site_part, message),
            }
        }

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

/// One log line as written to the log file.
fn format_entry(level: LogLevel, stage: Stage, site_id: Option<&str>, message: &str) -> String {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let site_part = site_id.map(|s| format!(" [{}]", s)).unwrap_or_default();
    format!("{} {} {}{}: {}", timestamp, level, stage, site_part, message)
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) {
    Logger::init(min_level, log_file.map(String::from), console_timestamps);
}

fn emit(level: LogLevel, stage: Stage, site_id: Option<&str>, message: &str) {
    if let Ok(guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_ref() {
            logger.log(level, stage, site_id, message);
        }
    }
}

/// Log a general informational message
pub fn info(stage: Stage, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Info, stage, site_id, message);
}

/// Log a warning message
pub fn warn(stage: Stage, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Warning, stage, site_id, message);
}

/// Log an error message
pub fn error(stage: Stage, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Error, stage, site_id, message);
}

/// Log a debug message
pub fn debug(stage: Stage, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Debug, stage, site_id, message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a USGS fetch failure from its rendered error message
pub fn classify_usgs_failure(error_message: &str) -> FailureType {
    if error_message.contains("HTTP error: 404") {
        // NWIS answers 404 when no site in the state matches the query window
        FailureType::Expected
    } else if error_message.contains("HTTP error")
        || error_message.contains("Parse error")
        || error_message.contains("timed out")
    {
        FailureType::Unexpected
    } else {
        FailureType::Unknown
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a USGS fetch failure with automatic classification
pub fn log_usgs_failure(operation: &str, err: &dyn std::error::Error) {
    let error_msg = err.to_string();
    let failure_type = classify_usgs_failure(&error_msg);

    let message = format!("{} failed [{}]: {}", operation, failure_type, error_msg);

    match failure_type {
        FailureType::Expected => debug(Stage::Usgs, None, &message),
        FailureType::Unexpected => error(Stage::Usgs, None, &message),
        FailureType::Unknown => warn(Stage::Usgs, None, &message),
    }
}

// ---------------------------------------------------------------------------
// Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of a chunked history fetch
pub fn log_history_summary(total_chunks: usize, successful: usize, records: usize) {
    let failed = total_chunks - successful.min(total_chunks);
    let message = format!(
        "History fetch complete: {}/{} chunks successful, {} failed, {} daily values",
        successful, total_chunks, failed, records
    );

    if failed == 0 {
        info(Stage::Baseline, None, &message);
    } else if successful == 0 {
        error(Stage::Baseline, None, &message);
    } else {
        warn(Stage::Baseline, None, &message);
    }
}
