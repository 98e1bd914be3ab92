/// One update run, end to end.
///
/// ingest → window append → rate of change → baseline comparison → persist.
///
/// The pipeline owns no state between runs: everything it needs is loaded
/// from the data directory at the start and everything it produces is
/// rendered in memory, then committed in one pass at the end. An error
/// before the commit leaves every file from the previous run untouched.
///
/// The window table is committed last. If a derived table fails to write,
/// the window keeps its previous contents, so the next run fetches the same
/// readings again and regenerates every output from them.
///
/// # Clock injection
/// `now` is passed in by the caller; nothing here reads the system clock
/// except the lock file's informational timestamp.

use crate::alert::high_flow::HighFlowSite;
use crate::analysis::baseline::{BaselineIndex, BaselineStatus};
use crate::analysis::compare::{ComparisonReport, PercentileComparator};
use crate::analysis::rate_of_change::RateOfChangeEngine;
use crate::config::Config;
use crate::ingest::{DailyHistorySource, ObservationSource, fetch_history};
use crate::logging::{self, Stage};
use crate::model::{NwisError, PipelineError, Region};
use crate::sites::SiteCatalog;
use crate::store::files::{
    self, BASELINE_FILE, COMPARISON_FILE, PROCESSED_FILE, PendingWrite, RATE_OF_CHANGE_FILE,
    WINDOW_FILE, format_timestamp,
};
use crate::store::lock::RunLock;
use crate::store::run_log::{self, RUN_LOG_FILE, RunRecord};
use crate::store::window::AppendOutcome;
use chrono::{DateTime, Utc};

/// What an update run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub fetched: usize,
    pub append: AppendOutcome,
    pub window_rows: usize,
    pub sites: usize,
    pub baseline: BaselineStatus,
    pub comparison: ComparisonReport,
}

impl RunReport {
    pub fn high_flow(&self) -> &[HighFlowSite] {
        &self.comparison.high_flow
    }
}

/// Runs one update against `source`.
///
/// `history` is only consulted when the baseline table is missing and
/// `fetch.auto_rebuild_baseline` is set; pass `None` to never rebuild
/// implicitly.
pub fn run_update(
    config: &Config,
    source: &dyn ObservationSource,
    history: Option<&dyn DailyHistorySource>,
    now: DateTime<Utc>,
) -> Result<RunReport, PipelineError> {
    let data_dir = config.data_dir.as_path();
    let _lock = RunLock::acquire(data_dir)?;

    // ---- Ingest ----
    let window_path = data_dir.join(WINDOW_FILE);
    let mut store = files::load_window(&window_path)?;
    let retention = config.retention();
    let start = store.fetch_start(now, retention);

    logging::info(
        Stage::Usgs,
        None,
        &format!(
            "Fetching readings from {} to {}",
            format_timestamp(start),
            format_timestamp(now)
        ),
    );
    let batch = match source.fetch_observations(start, now) {
        Ok(batch) => batch,
        Err(e) => {
            logging::log_usgs_failure("Instantaneous values fetch", &e);
            logging::error(
                Stage::Usgs,
                None,
                "Continuing with the existing window; outputs reflect the last successful fetch",
            );
            Vec::new()
        }
    };
    let fetched = batch.len();
    let append = store.append(batch, retention, now);

    let mut writes: Vec<PendingWrite> = Vec::new();

    // ---- Derive ----
    let sites = SiteCatalog::from_observations(store.observations());
    let engine = RateOfChangeEngine::from_config(config);
    let current = engine.latest_per_entity(&store);

    let baseline = baseline_status(config, history, now, &mut writes)?;
    match &baseline {
        BaselineStatus::Ready(_) => logging::info(Stage::Baseline, None, &baseline.diagnostic()),
        _ => logging::warn(Stage::Baseline, None, &baseline.diagnostic()),
    }

    let comparator = PercentileComparator::new(baseline.index(), &sites, config.latitude_midpoint);
    let comparison = comparator.compare(&current);

    // ---- Persist ----
    let lookbacks = engine.lookbacks();
    writes.push(files::render_rate_of_change(
        &data_dir.join(RATE_OF_CHANGE_FILE),
        &current,
        lookbacks,
    )?);
    writes.push(files::render_comparisons(
        &data_dir.join(COMPARISON_FILE),
        &comparison.rows,
    )?);
    writes.push(files::render_processed(
        &data_dir.join(PROCESSED_FILE),
        &comparison.rows,
        lookbacks,
        &sites,
    )?);
    writes.push(run_log::render_appended(
        &data_dir.join(RUN_LOG_FILE),
        RunRecord {
            timestamp: now,
            window_rows: store.len(),
            sites: sites.len(),
            high_flow_sites: comparison.high_flow.len(),
        },
    )?);
    if append != AppendOutcome::NothingNew {
        writes.push(files::render_window(&window_path, &store)?);
    }
    files::commit(&writes)?;

    logging::info(
        Stage::System,
        None,
        &format!(
            "Update complete: {} fetched, {} rows in window, {} sites ({} north, {} south), {} above P90",
            fetched,
            store.len(),
            sites.len(),
            sites.sites_in_region(Region::North, config.latitude_midpoint).len(),
            sites.sites_in_region(Region::South, config.latitude_midpoint).len(),
            comparison.high_flow.len()
        ),
    );

    Ok(RunReport {
        fetched,
        append,
        window_rows: store.len(),
        sites: sites.len(),
        baseline,
        comparison,
    })
}

/// Loads the persisted baseline, rebuilding it in memory when it is missing
/// and a history source is available. A rebuilt table is queued for commit
/// with the rest of the run's outputs.
fn baseline_status(
    config: &Config,
    history: Option<&dyn DailyHistorySource>,
    now: DateTime<Utc>,
    writes: &mut Vec<PendingWrite>,
) -> Result<BaselineStatus, PipelineError> {
    let path = config.data_dir.join(BASELINE_FILE);
    if let Some(index) = files::load_baseline(&path)? {
        return Ok(BaselineStatus::Ready(index));
    }

    let Some(history) = history.filter(|_| config.fetch.auto_rebuild_baseline) else {
        return Ok(BaselineStatus::NotBuilt);
    };

    logging::info(
        Stage::Baseline,
        None,
        "Historical P90 table missing or empty. Building it now.",
    );
    match build_baseline(config, history, now) {
        Ok(index) => {
            writes.push(files::render_baseline(&path, &index)?);
            Ok(BaselineStatus::Ready(index))
        }
        Err(e) => {
            logging::error(Stage::Baseline, None, &e.to_string());
            Ok(BaselineStatus::BuildFailed(e.to_string()))
        }
    }
}

/// Fetches the configured history and builds a baseline from it.
pub fn build_baseline(
    config: &Config,
    history: &dyn DailyHistorySource,
    now: DateTime<Utc>,
) -> Result<BaselineIndex, PipelineError> {
    let daily = fetch_history(
        history,
        now.date_naive(),
        config.fetch.history_years,
        config.fetch.chunk_years,
        std::time::Duration::from_millis(config.fetch.chunk_pause_ms),
    )?;

    let index = BaselineIndex::build(&daily, config.latitude_midpoint);
    if index.is_empty() {
        return Err(PipelineError::Fetch(NwisError::SourceUnavailable(
            "history contained no usable daily values".to_string(),
        )));
    }
    Ok(index)
}

/// Rebuilds the baseline table from scratch and writes it, replacing any
/// existing table. Takes the run lock.
pub fn rebuild_baseline(
    config: &Config,
    history: &dyn DailyHistorySource,
    now: DateTime<Utc>,
) -> Result<BaselineIndex, PipelineError> {
    let _lock = RunLock::acquire(&config.data_dir)?;
    let index = build_baseline(config, history, now)?;
    let path = config.data_dir.join(BASELINE_FILE);
    files::commit(&[files::render_baseline(&path, &index)?])?;
    logging::info(
        Stage::Baseline,
        None,
        &format!("Saved historical P90 table to {}", path.display()),
    );
    Ok(index)
}

/// Newest timestamp in the persisted window, or `now − retention` when it
/// is empty.
pub fn last_timestamp(config: &Config, now: DateTime<Utc>) -> Result<DateTime<Utc>, PipelineError> {
    let store = files::load_window(&config.data_dir.join(WINDOW_FILE))?;
    Ok(store.load_last_timestamp(now, config.retention()))
}
