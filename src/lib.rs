//! Virginia streamflow monitoring service.
//!
//! Keeps a rolling 24-hour window of USGS discharge readings for every
//! active stream gauge in the state, computes short-horizon rate of change
//! per gauge and compares current flow against a historical day-of-year
//! 90th-percentile baseline.

pub mod alert;
pub mod analysis;
pub mod cli;
pub mod config;
pub mod dev_mode;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod sites;
pub mod store;

pub use cli::{Cli, run};
