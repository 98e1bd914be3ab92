//! Command line surface: argument parsing and command dispatch.

use crate::config::Config;
use crate::dev_mode::DevMode;
use crate::ingest::{DailyHistorySource, ObservationSource};
use crate::ingest::usgs::NwisClient;
use crate::logging::{self, Stage};
use crate::model::PipelineError;
use crate::pipeline;
use crate::store::files::format_timestamp;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vaflow_service")]
#[command(about = "Virginia streamflow monitor: rolling window, rate of change and P90 comparison")]
#[command(version)]
pub struct Cli {
    /// Config file (default: $VAFLOW_CONFIG, then ./vaflow.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch new readings and regenerate every output table (default)
    Update {
        /// Replay a recorded window file instead of calling USGS
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Shift replayed readings forward by this many days
        #[arg(long, default_value_t = 0, requires = "replay")]
        days_offset: i64,
    },

    /// Rebuild the historical P90 table from USGS daily values
    RebuildBaseline,

    /// Print the newest timestamp in the persisted window
    LastTimestamp,
}

pub fn run(cli: Cli) -> Result<(), PipelineError> {
    let config = Config::from_env(cli.config.as_deref())?;
    logging::init_logger(
        config.log_level()?,
        config.logging.file.as_deref(),
        config.logging.console_timestamps,
    );

    let now = Utc::now();
    let command = cli.command.unwrap_or(Command::Update {
        replay: None,
        days_offset: 0,
    });

    match command {
        Command::Update { replay, days_offset } => {
            let client = NwisClient::new(&config.state_code, &config.fetch)?;
            let replay = replay.map(|path| DevMode::new(path, days_offset));
            if let Some(dev) = &replay {
                match dev.data_range() {
                    Ok(Some((first, last))) => logging::info(
                        Stage::Usgs,
                        None,
                        &format!(
                            "Replaying {} covering {} to {}",
                            dev.source_file.display(),
                            format_timestamp(first),
                            format_timestamp(last)
                        ),
                    ),
                    Ok(None) => logging::warn(
                        Stage::Usgs,
                        None,
                        &format!("Replay file {} has no readings", dev.source_file.display()),
                    ),
                    Err(e) => logging::warn(Stage::Usgs, None, &e.to_string()),
                }
            }
            let source: &dyn ObservationSource = match &replay {
                Some(dev) => dev,
                None => &client,
            };
            // A replayed run never reaches out to USGS for history either.
            let history: Option<&dyn DailyHistorySource> = if replay.is_some() {
                None
            } else {
                Some(&client)
            };
            pipeline::run_update(&config, source, history, now)?;
        }
        Command::RebuildBaseline => {
            let client = NwisClient::new(&config.state_code, &config.fetch)?;
            let index = pipeline::rebuild_baseline(&config, &client, now)?;
            logging::info(
                Stage::Baseline,
                None,
                &format!(
                    "Rebuilt baseline: {} site-day entries for {} sites",
                    index.len(),
                    index.entity_count()
                ),
            );
        }
        Command::LastTimestamp => {
            let last = pipeline::last_timestamp(&config, now)?;
            println!("{}", format_timestamp(last));
        }
    }
    Ok(())
}
