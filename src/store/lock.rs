/// Run lock.
///
/// Scheduled runs can overlap when one is slow (a long history rebuild, a
/// hanging upstream). Rather than reason about interleaved window appends,
/// a run takes an exclusive lock file in the data directory and a second run
/// fails fast with `PipelineError::RunInProgress`. The lock is released when
/// the guard is dropped, including on early return through `?`.

use crate::logging::{self, Stage};
use crate::model::PipelineError;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".run.lock";

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Creates the lock file in `data_dir`, failing if it already exists.
    pub fn acquire(data_dir: &Path) -> Result<RunLock, PipelineError> {
        fs::create_dir_all(data_dir).map_err(|e| PipelineError::io(data_dir, e))?;
        let path = data_dir.join(LOCK_FILE);

        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PipelineError::RunInProgress(path));
            }
            Err(e) => return Err(PipelineError::io(&path, e)),
        };
        let lock = RunLock::stamp(path, file)?;
        logging::debug(Stage::System, None, &format!("Acquired {}", lock.path.display()));
        Ok(lock)
    }

    /// Takes ownership of a freshly created lock file and records who holds
    /// it. The guard exists before the write, so a failed write still
    /// removes the file.
    fn stamp<W: Write>(path: PathBuf, mut out: W) -> Result<RunLock, PipelineError> {
        let lock = RunLock { path };
        writeln!(out, "pid={} started={}", std::process::id(), Utc::now().to_rfc3339())
            .and_then(|_| out.flush())
            .map_err(|e| PipelineError::io(&lock.path, e))?;
        Ok(lock)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            logging::warn(
                Stage::System,
                None,
                &format!("Failed to release {}: {}", self.path.display(), e),
            );
        }
    }
}
