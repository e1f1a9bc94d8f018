//! # yaribak
//!
//! Incremental backups as a series of hardlinked directory snapshots.
//!
//! ## Features
//!
//! - **Hardlink Snapshots**: Each snapshot is a full tree, but unchanged files share storage with the previous one
//! - **rsync or Native Sync**: Changed files are replaced, never written through a shared inode
//! - **Atomic Commit**: A snapshot only appears once a single rename succeeds
//! - **Self-Healing**: Leftovers of an interrupted run are removed by the next run
//! - **Only-If-Changed Mode**: Skip snapshots identical to their predecessor
//! - **Retention**: Keep the newest N snapshots
//! - **Dry Run**: Preview the exact action sequence without touching the target
//!
//! ## Quick Start
//!
//! ```no_run
//! use yaribak::backup::backup_config::BackupConfig;
//! use yaribak::backup::processor::BackupProcessor;
//!
//! let config = BackupConfig::from_yaml_file("config.yml")?.checked()?;
//! let report = BackupProcessor::new(config).process()?;
//! println!("{:?}", report.outcome);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
