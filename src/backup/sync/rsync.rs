use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::sync::Syncer;
use crate::backup::validate::validate_sync_extra_args;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use validator::Validate;

/// Archive mode plus ACLs, xattrs, hardlinks within the source, verbose.
const BASE_FLAGS: [&str; 3] = ["-aAXHv", "--delete", "--delete-excluded"];

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct RsyncSyncer {
    #[serde(default = "default_program")]
    #[builder(default = default_program(), into)]
    program: PathBuf,
    /// Appended after the built-in flags, before the source and destination.
    #[serde(default)]
    #[builder(default)]
    #[validate(custom(function = validate_sync_extra_args))]
    extra_args: Vec<String>,
}

fn default_program() -> PathBuf {
    PathBuf::from("rsync")
}

impl Default for RsyncSyncer {
    fn default() -> Self {
        RsyncSyncer::builder().build()
    }
}

impl RsyncSyncer {
    pub fn args(&self, source: &Path, dest: &Path, excludes: &[String]) -> Vec<OsString> {
        let mut args: Vec<OsString> = BASE_FLAGS.iter().map(OsString::from).collect();
        args.extend(excludes.iter().map(|e| OsString::from(format!("--exclude={e}"))));
        args.extend(self.extra_args.iter().map(OsString::from));

        // Trailing slash: copy the contents of source, not source itself.
        let mut source = source.as_os_str().to_os_string();
        if !source.as_bytes().ends_with(b"/") {
            source.push("/");
        }
        args.push(source);
        args.push(dest.as_os_str().to_os_string());
        args
    }

    fn command_line(&self, args: &[OsString]) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Syncer for RsyncSyncer {
    fn sync(&self, source: &Path, dest: &Path, excludes: &[String]) -> Result<()> {
        let args = self.args(source, dest, excludes);
        let command = self.command_line(&args);
        tracing::info!("Running {}", command);

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(Error::from)
            .with_msg(format!("Spawning {:?} failed", self.program))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::debug!("rsync: {}", line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::warn!("rsync: {}", line);
        }

        if !output.status.success() {
            return Err(Error::SyncFailed {
                command,
                status: output.status,
            });
        }

        Ok(())
    }
}
