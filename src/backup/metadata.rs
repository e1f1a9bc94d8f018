//! Per-snapshot metadata record, stored as `backup_context.json` next to the payload.

use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const CONTEXT_FILE_NAME: &str = "backup_context.json";

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupContext {
    /// Absolute path of the directory that was backed up.
    pub source: PathBuf,
    /// Creation time of the snapshot, seconds since the Unix epoch.
    pub epoch: i64,
    /// Last time an unchanged run confirmed this snapshot as current.
    #[serde(default)]
    pub updated_epoch: Option<i64>,
}

impl BackupContext {
    pub fn new<P: Into<PathBuf>>(source: P, created: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            epoch: created.timestamp(),
            updated_epoch: None,
        }
    }

    pub fn touched(&self, now: DateTime<Utc>) -> Self {
        Self {
            updated_epoch: Some(now.timestamp()),
            ..self.clone()
        }
    }

    pub fn path_in<P: AsRef<Path>>(snapshot_dir: P) -> PathBuf {
        snapshot_dir.as_ref().join(CONTEXT_FILE_NAME)
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let read = || -> Result<Self> {
            let reader = BufReader::new(File::open(path)?);
            Ok(serde_json::from_reader(reader)?)
        };
        read().with_msg(format!("Reading backup context {:?} failed", path))
    }

    /// Writes through a sibling temporary file and renames it into place, so readers never
    /// observe a truncated record.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let write = || -> Result<()> {
            let dir = path.parent().unwrap_or(Path::new("."));
            let mut tmp = tempfile::Builder::new()
                .prefix(".backup_context")
                .tempfile_in(dir)?;
            {
                let mut writer = BufWriter::new(tmp.as_file_mut());
                serde_json::to_writer_pretty(&mut writer, self)?;
                writer.write_all(b"\n")?;
                writer.flush()?;
            }
            tmp.as_file().sync_all()?;
            tmp.persist(path).map_err(|e| e.error)?;
            Ok(())
        };
        write().with_msg(format!("Writing backup context {:?} failed", path))
    }
}
