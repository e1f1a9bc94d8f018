//! Mirrors the live source into a snapshot payload.
//!
//! The payload has usually been hardlink-cloned from the previous snapshot, so every
//! backend must replace changed files by writing a new file and renaming it over the old
//! entry, never by writing into the existing inode.

pub mod native;
pub mod rsync;

use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::sync::native::NativeSyncer;
use crate::backup::sync::rsync::RsyncSyncer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::result;
use validator::{Validate, ValidationErrors};

pub trait Syncer {
    /// Makes `dest` an exact mirror of the contents of `source`, minus `excludes`.
    fn sync(&self, source: &Path, dest: &Path, excludes: &[String]) -> Result<()>;
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum SyncConfig {
    /// External `rsync` process.
    Rsync(RsyncSyncer),
    /// In-process copy, for hosts without rsync.
    Native,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig::Rsync(RsyncSyncer::default())
    }
}

impl Validate for SyncConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            SyncConfig::Rsync(inner) => inner.validate(),
            SyncConfig::Native => Ok(()),
        }
    }
}

impl Syncer for SyncConfig {
    fn sync(&self, source: &Path, dest: &Path, excludes: &[String]) -> Result<()> {
        match self {
            SyncConfig::Rsync(inner) => inner.sync(source, dest, excludes),
            SyncConfig::Native => NativeSyncer.sync(source, dest, excludes),
        }
        .with_debug_object_and_fn_name(self.clone(), "sync")
    }
}
