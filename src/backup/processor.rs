//! Runs one backup: clean stale state, clone, sync, write metadata, optionally
//! detect a no-op, commit by rename, prune.
//!
//! A run that fails at any step stops there. Nothing becomes visible as a snapshot
//! until the final rename, and the in-progress directory it leaves behind is removed
//! by the next run.

use crate::backup::action::{Action, ActionObserver, ActionRunner, TracingObserver};
use crate::backup::backup_config::BackupConfig;
use crate::backup::clock::{Clock, SystemClock};
use crate::backup::hardlink::is_hardlinked_replica;
use crate::backup::lock::TargetLock;
use crate::backup::metadata::BackupContext;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::retention;
use crate::backup::snapshot::{
    discover, incomplete_dir, snapshot_name, Snapshot, PAYLOAD_DIR_NAME,
};
use crate::backup::sync::native::is_in_sync;
use crate::backup::sync::Syncer;
use bon::Builder;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new snapshot was committed at this path.
    Committed(PathBuf),
    /// Nothing changed; the existing snapshot at this path was marked as current.
    Unchanged(PathBuf),
    /// Dry run, nothing was touched.
    Previewed,
}

#[derive(Clone, Debug)]
pub struct BackupReport {
    pub actions: Vec<Action>,
    pub outcome: Outcome,
}

#[derive(Builder)]
pub struct BackupProcessor {
    config: BackupConfig,
    #[builder(default = Box::new(SystemClock) as Box<dyn Clock>)]
    clock: Box<dyn Clock>,
    #[builder(default = Box::new(TracingObserver) as Box<dyn ActionObserver>)]
    observer: Box<dyn ActionObserver>,
    /// Overrides the backend selected by `config.sync`.
    syncer: Option<Box<dyn Syncer>>,
}

impl BackupProcessor {
    pub fn new(config: BackupConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn process(&mut self) -> Result<BackupReport> {
        let config = self.config.clone().checked()?;
        let source = config.source().clone();
        let target = config.target().clone();

        let snapshots = discover(&target)?;
        let _lock = if config.dryrun() {
            None
        } else {
            Some(TargetLock::acquire(&target, config.lock_timeout())?)
        };

        let syncer: &dyn Syncer = match &self.syncer {
            Some(s) => s.as_ref(),
            None => config.sync(),
        };
        let mut runner = ActionRunner::new(config.dryrun(), syncer, self.observer.as_mut());

        let previous = snapshots.last().cloned();
        tracing::info!(
            "Backing up {:?} into {:?}; {} existing snapshots, previous: {:?}",
            source,
            target,
            snapshots.len(),
            previous.as_ref().map(Snapshot::name)
        );

        let work = incomplete_dir(&target);
        let work_payload = work.join(PAYLOAD_DIR_NAME);
        if std::fs::symlink_metadata(&work).is_ok() {
            tracing::warn!("Removing leftover from an interrupted run: {:?}", work);
            runner.run(Action::DeleteTree { path: work.clone() })?;
        }

        runner.run(Action::CreateDir { path: work.clone() })?;
        match &previous {
            Some(prev) => runner.run(Action::CloneTree {
                from: prev.payload(),
                to: work_payload.clone(),
            })?,
            None => runner.run(Action::CreateDir {
                path: work_payload.clone(),
            })?,
        }

        runner.run(Action::RunSync {
            source: source.clone(),
            dest: work_payload.clone(),
            excludes: config.excludes().clone(),
        })?;

        if previous.is_none() {
            let md = std::fs::metadata(&source)
                .map_err(Error::from)
                .with_msg(format!("Reading owner of {:?} failed", source))?;
            runner.run(Action::ChangeOwner {
                path: work_payload.clone(),
                uid: md.uid(),
                gid: md.gid(),
            })?;
        }

        let now = self.clock.now();
        runner.run(Action::WriteMetadata {
            path: BackupContext::path_in(&work),
            context: BackupContext::new(source.clone(), now),
        })?;

        if let Some(prev) = previous.as_ref().filter(|_| config.only_if_changed()) {
            // A dry run never synced, so it asks whether the sync would have changed anything.
            let unchanged = if runner.is_dry_run() {
                is_in_sync(&source, &prev.payload(), config.excludes())
                    .with_msg("Quick check against previous snapshot failed")?
            } else {
                is_hardlinked_replica(prev.payload(), &work_payload)
                    .with_msg("Comparing with previous snapshot failed")?
            };
            let context_path = BackupContext::path_in(prev.path());
            if unchanged {
                match BackupContext::read(&context_path) {
                    Ok(context) => {
                        tracing::info!("No changes since {}; keeping it as current", prev.name());
                        runner.run(Action::DeleteTree { path: work.clone() })?;
                        runner.run(Action::WriteMetadata {
                            path: context_path,
                            context: context.touched(now),
                        })?;
                        let outcome = if runner.is_dry_run() {
                            Outcome::Previewed
                        } else {
                            Outcome::Unchanged(prev.path().to_path_buf())
                        };
                        return Ok(BackupReport {
                            actions: runner.into_log(),
                            outcome,
                        });
                    }
                    Err(e) => tracing::warn!(
                        "No changes since {}, but its metadata is unreadable; committing a new snapshot: {e}",
                        prev.name()
                    ),
                }
            }
        }

        let committed = Snapshot::new(target.join(snapshot_name(now)));
        runner.run(Action::Rename {
            from: work,
            to: committed.path().to_path_buf(),
        })?;

        let mut all = snapshots;
        all.push(committed.clone());
        for old in retention::get_delete(&all, config.max_to_keep()) {
            runner.run(Action::DeleteTree {
                path: old.path().to_path_buf(),
            })?;
        }

        let outcome = if runner.is_dry_run() {
            Outcome::Previewed
        } else {
            Outcome::Committed(committed.path().to_path_buf())
        };
        Ok(BackupReport {
            actions: runner.into_log(),
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::clock::FixedClock;
    use crate::backup::result_error::ErrorKind;
    use crate::backup::snapshot::{INCOMPLETE_NAME, LOCK_FILE_NAME};
    use crate::backup::sync::SyncConfig;
    use chrono::{DateTime, TimeZone, Utc};
    use std::fs::{self, create_dir_all, read_to_string, write};
    use std::path::Path;
    use tempfile::TempDir;

    struct Env {
        _temp_dir: TempDir,
        source: PathBuf,
        target: PathBuf,
    }

    fn env() -> Env {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src");
        let target = temp_dir.path().join("backups");
        create_dir_all(&source).unwrap();
        create_dir_all(&target).unwrap();
        write(source.join("a.txt"), "1").unwrap();
        write(source.join("b.txt"), "2").unwrap();
        Env {
            _temp_dir: temp_dir,
            source,
            target,
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
    }

    fn config(env: &Env) -> BackupConfig {
        BackupConfig::builder()
            .source(&env.source)
            .target(&env.target)
            .sync(SyncConfig::Native)
            .build()
    }

    fn only_if_changed(env: &Env) -> BackupConfig {
        BackupConfig::builder()
            .source(&env.source)
            .target(&env.target)
            .sync(SyncConfig::Native)
            .only_if_changed(true)
            .build()
    }

    fn run(config: BackupConfig, when: DateTime<Utc>) -> Result<BackupReport> {
        BackupProcessor::builder()
            .config(config)
            .clock(Box::new(FixedClock(when)))
            .build()
            .process()
    }

    fn ino<P: AsRef<Path>>(p: P) -> u64 {
        fs::metadata(p).unwrap().ino()
    }

    fn names(target: &Path) -> Vec<String> {
        discover(target)
            .unwrap()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn listing(dir: &Path) -> Vec<(PathBuf, u64)> {
        let mut v: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .map(|e| {
                let e = e.unwrap();
                (e.path().to_path_buf(), e.metadata().unwrap().ino())
            })
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_first_run_creates_snapshot() {
        let env = env();
        let report = run(config(&env), at(1)).unwrap();

        let snap = env.target.join("ysnap_20240501_120000");
        assert_eq!(report.outcome, Outcome::Committed(snap.clone()));
        assert_eq!(read_to_string(snap.join("payload/a.txt")).unwrap(), "1");
        assert_eq!(read_to_string(snap.join("payload/b.txt")).unwrap(), "2");

        let ctx = BackupContext::read(snap.join("backup_context.json")).unwrap();
        assert_eq!(ctx.source, env.source);
        assert_eq!(ctx.epoch, at(1).timestamp());
        assert_eq!(ctx.updated_epoch, None);
        assert!(!env.target.join(INCOMPLETE_NAME).exists());

        assert_eq!(report.actions.len(), 6);
        assert!(matches!(report.actions[0], Action::CreateDir { .. }));
        assert!(matches!(report.actions[1], Action::CreateDir { .. }));
        assert!(matches!(report.actions[2], Action::RunSync { .. }));
        assert!(matches!(report.actions[3], Action::ChangeOwner { .. }));
        assert!(matches!(report.actions[4], Action::WriteMetadata { .. }));
        assert!(matches!(report.actions[5], Action::Rename { .. }));
    }

    #[test]
    fn test_second_run_shares_unchanged_files() {
        let env = env();
        run(config(&env), at(1)).unwrap();
        write(env.source.join("a.txt"), "3").unwrap();
        let report = run(config(&env), at(2)).unwrap();

        let s1 = env.target.join("ysnap_20240501_120000/payload");
        let s2 = env.target.join("ysnap_20240502_120000/payload");
        assert_eq!(report.outcome, Outcome::Committed(s2.parent().unwrap().to_path_buf()));
        assert!(matches!(report.actions[1], Action::CloneTree { .. }));
        assert!(!report
            .actions
            .iter()
            .any(|a| matches!(a, Action::ChangeOwner { .. })));

        assert_eq!(ino(s1.join("b.txt")), ino(s2.join("b.txt")));
        assert_ne!(ino(s1.join("a.txt")), ino(s2.join("a.txt")));
        assert_eq!(read_to_string(s2.join("a.txt")).unwrap(), "3");
        assert_eq!(read_to_string(s1.join("a.txt")).unwrap(), "1");
    }

    #[test]
    fn test_deleted_source_file_disappears_from_new_snapshot_only() {
        let env = env();
        run(config(&env), at(1)).unwrap();
        fs::remove_file(env.source.join("b.txt")).unwrap();
        run(config(&env), at(2)).unwrap();

        assert!(env.target.join("ysnap_20240501_120000/payload/b.txt").exists());
        assert!(!env.target.join("ysnap_20240502_120000/payload/b.txt").exists());
    }

    #[test]
    fn test_excludes_are_applied() {
        let env = env();
        create_dir_all(env.source.join("cache")).unwrap();
        write(env.source.join("cache/x"), "x").unwrap();
        write(env.source.join("scratch.tmp"), "t").unwrap();
        let config = BackupConfig::builder()
            .source(&env.source)
            .target(&env.target)
            .sync(SyncConfig::Native)
            .excludes(vec!["*.tmp".to_string(), "/cache/".to_string()])
            .build();
        run(config, at(1)).unwrap();

        let payload = env.target.join("ysnap_20240501_120000/payload");
        assert!(payload.join("a.txt").exists());
        assert!(!payload.join("cache").exists());
        assert!(!payload.join("scratch.tmp").exists());
    }

    #[test]
    fn test_interrupted_run_is_cleaned_up() {
        let env = env();
        run(config(&env), at(1)).unwrap();

        // A run that died after syncing but before the commit rename.
        let stale = env.target.join(INCOMPLETE_NAME);
        create_dir_all(stale.join("payload")).unwrap();
        write(stale.join("payload/partial"), "junk").unwrap();
        assert_eq!(names(&env.target), vec!["ysnap_20240501_120000"]);

        let report = run(config(&env), at(2)).unwrap();
        assert!(matches!(
            &report.actions[0],
            Action::DeleteTree { path } if path == &stale
        ));
        assert_eq!(
            names(&env.target),
            vec!["ysnap_20240501_120000", "ysnap_20240502_120000"]
        );
        assert!(!stale.exists());
        assert!(!env
            .target
            .join("ysnap_20240502_120000/payload/partial")
            .exists());
    }

    #[test]
    fn test_sync_failure_leaves_incomplete_and_commits_nothing() {
        let env = env();
        run(config(&env), at(1)).unwrap();

        let failing = BackupConfig::builder()
            .source(&env.source)
            .target(&env.target)
            .sync(SyncConfig::Rsync(
                crate::backup::sync::rsync::RsyncSyncer::builder()
                    .program("false")
                    .build(),
            ))
            .build();
        let err = run(failing, at(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sync);
        assert!(env.target.join(INCOMPLETE_NAME).exists());
        assert_eq!(names(&env.target), vec!["ysnap_20240501_120000"]);

        run(config(&env), at(3)).unwrap();
        assert!(!env.target.join(INCOMPLETE_NAME).exists());
        assert_eq!(
            names(&env.target),
            vec!["ysnap_20240501_120000", "ysnap_20240503_120000"]
        );
    }

    #[test]
    fn test_retention_keeps_most_recent() {
        let env = env();
        for day in 1..=4 {
            run(config(&env), at(day)).unwrap();
        }
        let config = BackupConfig::builder()
            .source(&env.source)
            .target(&env.target)
            .sync(SyncConfig::Native)
            .max_to_keep(2)
            .build();
        let report = run(config, at(5)).unwrap();

        assert_eq!(
            names(&env.target),
            vec!["ysnap_20240504_120000", "ysnap_20240505_120000"]
        );
        let deleted: Vec<_> = report
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::DeleteTree { path } => path.file_name(),
                _ => None,
            })
            .collect();
        assert_eq!(
            deleted,
            vec![
                "ysnap_20240501_120000",
                "ysnap_20240502_120000",
                "ysnap_20240503_120000"
            ]
        );
    }

    #[test]
    fn test_only_if_changed_reuses_previous_snapshot() {
        let env = env();
        run(only_if_changed(&env), at(1)).unwrap();
        let report = run(only_if_changed(&env), at(2)).unwrap();

        let s1 = env.target.join("ysnap_20240501_120000");
        assert_eq!(report.outcome, Outcome::Unchanged(s1.clone()));
        assert_eq!(names(&env.target), vec!["ysnap_20240501_120000"]);
        assert!(!env.target.join(INCOMPLETE_NAME).exists());

        let ctx = BackupContext::read(s1.join("backup_context.json")).unwrap();
        assert_eq!(ctx.epoch, at(1).timestamp());
        assert_eq!(ctx.updated_epoch, Some(at(2).timestamp()));

        write(env.source.join("new.txt"), "n").unwrap();
        let report = run(only_if_changed(&env), at(3)).unwrap();
        assert!(matches!(report.outcome, Outcome::Committed(_)));
        assert_eq!(
            names(&env.target),
            vec!["ysnap_20240501_120000", "ysnap_20240503_120000"]
        );
    }

    #[test]
    fn test_only_if_changed_with_unreadable_metadata_commits() {
        let env = env();
        run(only_if_changed(&env), at(1)).unwrap();
        fs::remove_file(env.target.join("ysnap_20240501_120000/backup_context.json")).unwrap();

        let report = run(only_if_changed(&env), at(2)).unwrap();
        let s2 = env.target.join("ysnap_20240502_120000");
        assert_eq!(report.outcome, Outcome::Committed(s2.clone()));
        assert!(!env.target.join(INCOMPLETE_NAME).exists());
        assert_eq!(
            BackupContext::read(s2.join("backup_context.json")).unwrap().epoch,
            at(2).timestamp()
        );
    }

    #[test]
    fn test_dry_run_preview_matches_unchanged_run() {
        let env = env();
        run(only_if_changed(&env), at(1)).unwrap();
        let before = listing(&env.target);

        let preview = run(only_if_changed(&env).with_overrides(true, false, false), at(2)).unwrap();
        assert_eq!(preview.outcome, Outcome::Previewed);
        assert_eq!(listing(&env.target), before);

        let real = run(only_if_changed(&env), at(2)).unwrap();
        assert!(matches!(real.outcome, Outcome::Unchanged(_)));
        assert_eq!(preview.actions, real.actions);
    }

    #[test]
    fn test_dry_run_preview_matches_changed_run() {
        let env = env();
        run(only_if_changed(&env), at(1)).unwrap();
        write(env.source.join("a.txt"), "changed").unwrap();

        let preview = run(only_if_changed(&env).with_overrides(true, false, false), at(2)).unwrap();
        let real = run(only_if_changed(&env), at(2)).unwrap();
        assert!(matches!(real.outcome, Outcome::Committed(_)));
        assert_eq!(preview.actions, real.actions);
    }

    #[test]
    fn test_dry_run_does_not_touch_target() {
        let env = env();
        run(config(&env), at(1)).unwrap();
        create_dir_all(env.target.join(INCOMPLETE_NAME)).unwrap();
        write(env.source.join("a.txt"), "changed").unwrap();
        let before = listing(&env.target);

        let dry = config(&env).with_overrides(true, false, false);
        let preview = run(dry, at(2)).unwrap();
        assert_eq!(preview.outcome, Outcome::Previewed);
        assert_eq!(listing(&env.target), before);

        let real = run(config(&env), at(2)).unwrap();
        assert_eq!(preview.actions, real.actions);
    }

    #[test]
    fn test_dry_run_preview_matches_first_run() {
        let env = env();
        let preview = run(config(&env).with_overrides(true, false, false), at(1)).unwrap();
        assert!(names(&env.target).is_empty());
        assert_eq!(fs::read_dir(&env.target).unwrap().count(), 0);
        assert!(!env.target.join(LOCK_FILE_NAME).exists());

        let real = run(config(&env), at(1)).unwrap();
        assert_eq!(preview.actions, real.actions);
    }

    #[test]
    fn test_invalid_target_is_configuration_error() {
        let env = env();
        let config = BackupConfig::builder()
            .source(&env.source)
            .target(env.target.join("missing"))
            .sync(SyncConfig::Native)
            .build();
        let err = run(config, at(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_zero_max_to_keep_is_rejected_before_pruning() {
        let env = env();
        for day in 1..=3 {
            run(config(&env), at(day)).unwrap();
        }
        let config = BackupConfig::builder()
            .source(&env.source)
            .target(&env.target)
            .sync(SyncConfig::Native)
            .max_to_keep(0)
            .build();
        let err = run(config, at(4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            names(&env.target),
            vec![
                "ysnap_20240501_120000",
                "ysnap_20240502_120000",
                "ysnap_20240503_120000"
            ]
        );
        assert!(!env.target.join(INCOMPLETE_NAME).exists());
    }

    #[test]
    fn test_relative_source_is_recorded_absolute() {
        let env = env();
        let cwd = std::env::current_dir().unwrap();
        let up: PathBuf = cwd.components().skip(1).map(|_| "..").collect();
        let relative = up.join(env.source.strip_prefix("/").unwrap());
        assert!(relative.is_relative());

        let config = BackupConfig::builder()
            .source(&relative)
            .target(&env.target)
            .sync(SyncConfig::Native)
            .build();
        run(config, at(1)).unwrap();

        let ctx =
            BackupContext::read(env.target.join("ysnap_20240501_120000/backup_context.json")).unwrap();
        assert!(ctx.source.is_absolute());
        assert_eq!(
            ctx.source.canonicalize().unwrap(),
            env.source.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_missing_source_is_configuration_error() {
        let env = env();
        let config = BackupConfig::builder()
            .source(env.source.join("missing"))
            .target(&env.target)
            .sync(SyncConfig::Native)
            .build();
        let err = run(config, at(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(fs::read_dir(&env.target).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_run_is_refused() {
        let env = env();
        let _held = TargetLock::acquire(&env.target, std::time::Duration::ZERO).unwrap();
        let err = run(config(&env), at(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);
        assert!(names(&env.target).is_empty());
    }

    #[test]
    fn test_same_second_commit_is_refused() {
        let env = env();
        run(config(&env), at(1)).unwrap();
        let err = run(config(&env), at(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert_eq!(names(&env.target), vec!["ysnap_20240501_120000"]);
    }

    struct CountingObserver(std::rc::Rc<std::cell::Cell<usize>>);

    impl ActionObserver for CountingObserver {
        fn on_action(&mut self, _action: &Action, _executed: bool) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_injected_observer_and_syncer() {
        let env = env();
        let seen = std::rc::Rc::new(std::cell::Cell::new(0));
        let report = BackupProcessor::builder()
            .config(
                BackupConfig::builder()
                    .source(&env.source)
                    .target(&env.target)
                    .build(),
            )
            .clock(Box::new(FixedClock(at(1))))
            .observer(Box::new(CountingObserver(seen.clone())))
            .syncer(Box::new(crate::backup::sync::native::NativeSyncer))
            .build()
            .process()
            .unwrap();
        assert_eq!(seen.get(), report.actions.len());
        assert!(matches!(report.outcome, Outcome::Committed(_)));
    }
}
