//! Advisory lock keeping two runs from working on the same target.
//!
//! Without it, a second run's stale-directory cleanup would delete the snapshot the
//! first run is still building.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::snapshot::LOCK_FILE_NAME;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const LOCK_POLL_MS: u64 = 25;

/// Held for the duration of a run; released on drop. The lock file itself stays in
/// the target so the next run locks the same inode.
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    path: PathBuf,
}

impl TargetLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locks `<target>/.ysnap.lock`, polling until `timeout` has elapsed.
    pub fn acquire<P: AsRef<Path>>(target: P, timeout: Duration) -> Result<Self> {
        let path = target.as_ref().join(LOCK_FILE_NAME);
        let t0 = Instant::now();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::from)
            .with_msg(format!("Opening lock file {:?} failed", path))?;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    tracing::debug!("Acquired lock {:?}", path);
                    return Ok(Self { file, path });
                }
                Err(_e) => {
                    if t0.elapsed() >= timeout {
                        return Err(Error::Locked(path));
                    }
                    thread::sleep(Duration::from_millis(LOCK_POLL_MS));
                }
            }
        }
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
