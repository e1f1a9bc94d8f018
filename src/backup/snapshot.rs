//! Snapshot directory naming and discovery.
//!
//! Committed snapshots are named `ysnap_<YYYYMMDD_HHMMSS>` so that sorting the names
//! sorts them chronologically. A run builds its snapshot under the fixed name
//! `ysnap__incomplete`, which discovery never reports.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use chrono::{DateTime, NaiveDateTime, Utc};
use itertools::Itertools;
use std::fs::read_dir;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_PREFIX: &str = "ysnap_";
pub const INCOMPLETE_NAME: &str = "ysnap__incomplete";
pub const PAYLOAD_DIR_NAME: &str = "payload";
pub const LOCK_FILE_NAME: &str = ".ysnap.lock";

static TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snapshot {
    path: PathBuf,
}

impl Snapshot {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn payload(&self) -> PathBuf {
        self.path.join(PAYLOAD_DIR_NAME)
    }
}

pub fn snapshot_name(dt: DateTime<Utc>) -> String {
    format!("{SNAPSHOT_PREFIX}{}", dt.format(TIME_FORMAT))
}

pub fn incomplete_dir<P: AsRef<Path>>(target: P) -> PathBuf {
    target.as_ref().join(INCOMPLETE_NAME)
}

/// True for `ysnap_` followed by a timestamp in the naming format.
pub fn is_snapshot_name(name: &str) -> bool {
    name.strip_prefix(SNAPSHOT_PREFIX)
        .is_some_and(|stamp| NaiveDateTime::parse_from_str(stamp, TIME_FORMAT).is_ok())
}

/// Lists the committed snapshots under `target`, oldest first.
pub fn discover<P: AsRef<Path>>(target: P) -> Result<Vec<Snapshot>> {
    let target = target.as_ref();
    if !target.is_dir() {
        return Err(Error::configuration(format!(
            "target {:?} is not an existing directory",
            target
        )));
    }

    let entries = read_dir(target)
        .map_err(Error::from)
        .with_msg(format!("Listing target {:?} failed", target))?;

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry?;
        let is_snapshot = entry.file_name().to_str().is_some_and(is_snapshot_name);
        if is_snapshot && entry.file_type()?.is_dir() {
            snapshots.push(Snapshot::new(entry.path()));
        }
    }

    Ok(snapshots
        .into_iter()
        .sorted_unstable_by(|a, b| a.name().cmp(b.name()))
        .collect())
}
