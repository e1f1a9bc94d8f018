//! Validation functions for configuration values.
//!
//! Provides custom validation functions for the source and target directories,
//! exclude patterns and extra sync arguments.

use validator::ValidationError;

use std::path::Path;

/// rsync flags that update destination files in place and would therefore
/// write through a hardlink into the previous snapshot.
pub const WRITE_THROUGH_FLAGS: [&str; 3] = ["--inplace", "--append", "--append-verify"];

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

pub fn validate_excludes(excludes: &[String]) -> Result<(), ValidationError> {
    if excludes.iter().any(|e| e.trim().is_empty()) {
        return Err(ValidationError::new("InvalidExclude")
            .with_message("exclude patterns must not be empty".into()));
    }

    Ok(())
}

pub fn validate_sync_extra_args(args: &[String]) -> Result<(), ValidationError> {
    if let Some(flag) = args.iter().find(|a| {
        WRITE_THROUGH_FLAGS
            .iter()
            .any(|f| a.as_str() == *f || a.starts_with(&format!("{f}=")))
    }) {
        return Err(ValidationError::new("InvalidSyncArgument").with_message(
            format!("{flag:?} writes into hardlinked files and would corrupt older snapshots")
                .into(),
        ));
    }

    Ok(())
}
