use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info, Level};
use yaribak::backup::backup_config::BackupConfig;
use yaribak::backup::processor::{BackupProcessor, Outcome};
use yaribak::backup::result_error::error::Error;
use yaribak::backup::result_error::result::Result;
use yaribak::backup::sync::SyncConfig;

/// Incremental hardlink snapshots of a directory
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of a YAML config file; the flags below are ignored when given, except the switches
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory to back up
    #[arg(long, required_unless_present = "config")]
    source: Option<PathBuf>,
    /// Directory holding the snapshots
    #[arg(long, required_unless_present = "config")]
    target: Option<PathBuf>,
    /// Keep at most this many snapshots
    #[arg(long)]
    max_to_keep: Option<usize>,
    /// rsync-style exclude pattern, repeatable
    #[arg(long = "exclude")]
    excludes: Vec<String>,
    /// Print the actions without performing them
    #[arg(long)]
    dryrun: bool,
    #[arg(short, long)]
    verbose: bool,
    /// Do not create a snapshot when nothing changed since the last one
    #[arg(long)]
    only_if_changed: bool,
    /// Copy in-process instead of running rsync
    #[arg(long)]
    native: bool,
}

fn load_config(args: &Args) -> Result<BackupConfig> {
    let config = match &args.config {
        Some(path) => BackupConfig::from_yaml_file(path)?,
        None => {
            let (Some(source), Some(target)) = (&args.source, &args.target) else {
                return Err(Error::configuration("--source and --target are required"));
            };
            BackupConfig::builder()
                .source(source)
                .target(target)
                .maybe_max_to_keep(args.max_to_keep)
                .excludes(args.excludes.clone())
                .sync(if args.native {
                    SyncConfig::Native
                } else {
                    SyncConfig::default()
                })
                .build()
        }
    };
    config
        .with_overrides(args.dryrun, args.verbose, args.only_if_changed)
        .checked()
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let res = load_config(&args).and_then(|config| {
        let dryrun = config.dryrun();
        BackupProcessor::new(config).process().map(|r| (dryrun, r))
    });

    match res {
        Ok((dryrun, report)) => {
            if dryrun {
                for action in &report.actions {
                    println!("{action}");
                }
            }
            match report.outcome {
                Outcome::Committed(path) => info!("Created snapshot {:?}", path),
                Outcome::Unchanged(path) => info!("No changes, kept {:?}", path),
                Outcome::Previewed => info!("Dry run: {} actions", report.actions.len()),
            }
        }
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
