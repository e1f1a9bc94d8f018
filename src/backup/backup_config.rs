use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::sync::SyncConfig;
use crate::backup::validate::{validate_dir_exist, validate_excludes};
use bon::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Directory to back up.
    #[validate(custom(function = validate_dir_exist))]
    #[builder(into)]
    #[getset(get = "pub")]
    source: PathBuf,
    /// Directory holding the snapshots.
    #[validate(custom(function = validate_dir_exist))]
    #[builder(into)]
    #[getset(get = "pub")]
    target: PathBuf,
    /// Number of committed snapshots to keep. Absent means keep all.
    #[validate(range(min = 1, message = "max_to_keep must be at least 1; omit it to keep every snapshot"))]
    #[getset(get_copy = "pub")]
    max_to_keep: Option<usize>,
    #[serde(default)]
    #[builder(default)]
    #[validate(custom(function = validate_excludes))]
    #[getset(get = "pub")]
    excludes: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    dryrun: bool,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    verbose: bool,
    /// Reuse the previous snapshot when nothing changed since it was taken.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    only_if_changed: bool,
    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    sync: SyncConfig,
    /// How long to wait for another run to release the target.
    #[serde(default, with = "humantime_serde")]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    lock_timeout: Duration,
}

impl BackupConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, BackupConfig>(f).map_err(Error::from))
            .with_msg(format!("Parse YAML config failed: {:?}", path))
    }

    /// Validates and makes `source` and `target` absolute, so the metadata always
    /// records an absolute source path.
    pub fn checked(mut self) -> Result<Self> {
        self.validate()
            .and_then(|_| self.sync.validate())
            .map_err(Error::from)
            .with_msg("Config validation failed")?;
        self.source = std::path::absolute(&self.source)?;
        self.target = std::path::absolute(&self.target)?;
        Ok(self)
    }

    pub fn with_overrides(mut self, dryrun: bool, verbose: bool, only_if_changed: bool) -> Self {
        self.dryrun |= dryrun;
        self.verbose |= verbose;
        self.only_if_changed |= only_if_changed;
        self
    }
}
