/// On-disk state of the service.
///
/// Submodules:
/// - `window` — the in-memory rolling observation window.
/// - `files` — CSV load/render and atomic commit of every table.
/// - `lock` — the run lock that serializes pipeline runs.
/// - `run_log` — the bounded log of completed update runs.

pub mod files;
pub mod lock;
pub mod run_log;
pub mod window;
