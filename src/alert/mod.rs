//! High-flow alerting.
//!
//! Notification dispatch is not implemented; for now an "alert" is the named
//! list of gauges above their P90 baseline, surfaced through the log.

pub mod high_flow;
