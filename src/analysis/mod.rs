/// Derived analytics over the observation window.
///
/// Submodules:
/// - `rate_of_change` — per-gauge percent change over sample-count lookbacks.
/// - `baseline` — the day-of-year P90 table built from daily history.
/// - `compare` — left join of current flow against the baseline.

pub mod baseline;
pub mod compare;
pub mod rate_of_change;
