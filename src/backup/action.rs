//! Every filesystem mutation a run performs, as data.
//!
//! The processor never touches the target directly; it hands [`Action`]s to an
//! [`ActionRunner`], which reports each one to an observer, records it, and executes
//! it unless the run is a dry run. A dry run therefore produces the same action
//! sequence as the real run would.

use crate::backup::function_path;
use crate::backup::hardlink::clone_tree;
use crate::backup::metadata::BackupContext;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::backup::sync::Syncer;
use derive_more::Display;
use function_name::named;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum Action {
    #[display("Delete {}", path.display())]
    DeleteTree { path: PathBuf },
    #[display("Create directory {}", path.display())]
    CreateDir { path: PathBuf },
    #[display("Hardlink {} into {}", from.display(), to.display())]
    CloneTree { from: PathBuf, to: PathBuf },
    #[display("Sync {}/ into {} excluding {:?}", source.display(), dest.display(), excludes)]
    RunSync {
        source: PathBuf,
        dest: PathBuf,
        excludes: Vec<String>,
    },
    #[display("Change owner of {} to {}:{}", path.display(), uid, gid)]
    ChangeOwner { path: PathBuf, uid: u32, gid: u32 },
    #[display("Write {} (source {}, epoch {}, updated {:?})",
        path.display(), context.source.display(), context.epoch, context.updated_epoch)]
    WriteMetadata {
        path: PathBuf,
        context: BackupContext,
    },
    #[display("Rename {} to {}", from.display(), to.display())]
    Rename { from: PathBuf, to: PathBuf },
}

/// Injected sink for the action stream of a run.
pub trait ActionObserver {
    fn on_action(&mut self, action: &Action, executed: bool);
}

/// Logs each action at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl ActionObserver for TracingObserver {
    fn on_action(&mut self, action: &Action, executed: bool) {
        if executed {
            tracing::info!("{}", action);
        } else {
            tracing::info!("[dry-run] {}", action);
        }
    }
}

pub struct ActionRunner<'a> {
    dry_run: bool,
    syncer: &'a dyn Syncer,
    observer: &'a mut dyn ActionObserver,
    log: Vec<Action>,
}

impl<'a> ActionRunner<'a> {
    pub fn new(dry_run: bool, syncer: &'a dyn Syncer, observer: &'a mut dyn ActionObserver) -> Self {
        Self {
            dry_run,
            syncer,
            observer,
            log: Vec::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    #[named]
    pub fn run(&mut self, action: Action) -> Result<()> {
        self.observer.on_action(&action, !self.dry_run);
        if !self.dry_run {
            execute(&action, self.syncer)
                .with_debug_object_and_fn_name(action.clone(), function_path!())?;
        }
        self.log.push(action);
        Ok(())
    }

    pub fn into_log(self) -> Vec<Action> {
        self.log
    }
}

fn execute(action: &Action, syncer: &dyn Syncer) -> Result<()> {
    match action {
        Action::DeleteTree { path } => fs::remove_dir_all(path).map_err(Error::from),
        Action::CreateDir { path } => fs::create_dir(path).map_err(Error::from),
        Action::CloneTree { from, to } => clone_tree(from, to),
        Action::RunSync {
            source,
            dest,
            excludes,
        } => syncer.sync(source, dest, excludes),
        Action::ChangeOwner { path, uid, gid } => {
            let md = fs::metadata(path)?;
            if md.uid() == *uid && md.gid() == *gid {
                tracing::debug!("{:?} already owned by {}:{}", path, uid, gid);
                return Ok(());
            }
            std::os::unix::fs::chown(path, Some(*uid), Some(*gid)).map_err(Error::from)
        }
        Action::WriteMetadata { path, context } => context.write(path),
        Action::Rename { from, to } => {
            // rename(2) silently replaces an empty directory at `to`.
            if fs::symlink_metadata(to).is_ok() {
                return Err(Error::from(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{:?} already exists", to),
                )));
            }
            fs::rename(from, to)
                .map_err(Error::from)
                .with_msg(format!("Committing {:?} as {:?} failed", from, to))
        }
    }
}
