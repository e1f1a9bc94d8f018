use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::sync::Syncer;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::fs::{self, File, Metadata, Permissions};
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// In-process mirror with rsync's `-aH --delete --delete-excluded` semantics,
/// minus ownership, ACLs and xattrs.
///
/// A file counts as unchanged when its size, mtime and permission bits match.
/// Changed files are written to a temporary file next to the destination and
/// renamed over it, which leaves any hardlinked copy of the old file untouched.
/// Names that share an inode in the source share one in the destination too.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeSyncer;

/// Exclude patterns in rsync's shape, compiled to globs.
///
/// `/x` is anchored at the source root, anything else matches at any depth,
/// and a trailing `/` only matches directories.
#[derive(Debug)]
pub struct ExcludeMatcher {
    any: GlobSet,
    dir_only: GlobSet,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut any = GlobSetBuilder::new();
        let mut dir_only = GlobSetBuilder::new();
        for pattern in patterns {
            let mut p = pattern.trim();
            let only_dirs = p.ends_with('/');
            p = p.trim_end_matches('/');
            let glob = match p.strip_prefix('/') {
                Some(anchored) => anchored.to_string(),
                None => format!("**/{p}"),
            };
            let glob = GlobBuilder::new(&glob)
                .literal_separator(true)
                .build()
                .map_err(Error::from)
                .with_msg(format!("Invalid exclude pattern {:?}", pattern))?;
            if only_dirs {
                dir_only.add(glob);
            } else {
                any.add(glob);
            }
        }
        Ok(Self {
            any: any.build()?,
            dir_only: dir_only.build()?,
        })
    }

    pub fn is_excluded(&self, rel: &Path, is_dir: bool) -> bool {
        self.any.is_match(rel) || (is_dir && self.dir_only.is_match(rel))
    }
}

#[derive(Debug, Default)]
struct SyncStats {
    copied: usize,
    kept: usize,
    deleted: usize,
}

impl Syncer for NativeSyncer {
    fn sync(&self, source: &Path, dest: &Path, excludes: &[String]) -> Result<()> {
        if !source.is_dir() {
            return Err(Error::configuration(format!(
                "source {:?} is not a directory",
                source
            )));
        }
        let matcher = ExcludeMatcher::new(excludes)?;
        let mut stats = SyncStats::default();

        fs::create_dir_all(dest)?;
        ensure_writable(dest)?;
        delete_extraneous(source, dest, &matcher, &mut stats)?;
        let dirs = copy_changed(source, dest, &matcher, &mut stats)?;

        for (dir, permissions) in dirs.into_iter().rev() {
            fs::set_permissions(&dir, permissions)?;
        }
        fs::set_permissions(dest, fs::metadata(source)?.permissions())?;

        tracing::info!(
            "Synced {:?} into {:?}: {} copied, {} unchanged, {} deleted",
            source,
            dest,
            stats.copied,
            stats.kept,
            stats.deleted
        );
        Ok(())
    }
}

fn delete_extraneous(
    source: &Path,
    dest: &Path,
    matcher: &ExcludeMatcher,
    stats: &mut SyncStats,
) -> Result<()> {
    let mut entries = WalkDir::new(dest).follow_links(false).min_depth(1).into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(dest)?;
        let is_dir = entry.file_type().is_dir();
        let keep = !matcher.is_excluded(rel, is_dir)
            && fs::symlink_metadata(source.join(rel))
                .map(|md| md.is_dir() == is_dir)
                .unwrap_or(false);
        if keep {
            if is_dir {
                ensure_writable(entry.path())?;
            }
            continue;
        }

        tracing::debug!("Deleting {:?}", entry.path());
        let removed = if is_dir {
            entries.skip_current_dir();
            fs::remove_dir_all(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        removed
            .map_err(Error::from)
            .with_msg(format!("Deleting {:?} failed", entry.path()))?;
        stats.deleted += 1;
    }
    Ok(())
}

/// Source entries below the root that no exclude pattern removes.
fn included<'a>(
    source: &'a Path,
    matcher: &'a ExcludeMatcher,
) -> impl Iterator<Item = walkdir::Result<DirEntry>> + 'a {
    WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(move |e| {
            e.path()
                .strip_prefix(source)
                .map(|rel| !matcher.is_excluded(rel, e.file_type().is_dir()))
                .unwrap_or(true)
        })
}

fn copy_changed(
    source: &Path,
    dest: &Path,
    matcher: &ExcludeMatcher,
    stats: &mut SyncStats,
) -> Result<Vec<(PathBuf, Permissions)>> {
    let mut dirs = Vec::new();
    // (dev, ino) of multiply-linked source files -> first destination name written
    let mut linked: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for entry in included(source, matcher) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source)?;
        let dst = dest.join(rel);
        let src_md = entry.metadata()?;
        let dst_md = fs::symlink_metadata(&dst).ok();

        if src_md.is_dir() {
            if dst_md.is_none() {
                fs::create_dir(&dst)?;
            }
            dirs.push((dst, src_md.permissions()));
        } else if src_md.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            let current = dst_md
                .filter(|md| md.file_type().is_symlink())
                .and_then(|_| fs::read_link(&dst).ok());
            if current.as_ref() == Some(&target) {
                stats.kept += 1;
                continue;
            }
            if fs::symlink_metadata(&dst).is_ok() {
                fs::remove_file(&dst)?;
            }
            symlink(&target, &dst)?;
            stats.copied += 1;
        } else if src_md.is_file() {
            if src_md.nlink() > 1 {
                let key = (src_md.dev(), src_md.ino());
                if let Some(first) = linked.get(&key) {
                    if link_to(first, &dst, dst_md.as_ref())? {
                        stats.copied += 1;
                    } else {
                        stats.kept += 1;
                    }
                    continue;
                }
                linked.insert(key, dst.clone());
            }
            if dst_md.is_some_and(|md| md.is_file() && is_unchanged(&src_md, &md)) {
                stats.kept += 1;
                continue;
            }
            replace_file(entry.path(), &dst, &src_md)
                .with_msg(format!("Copying {:?} to {:?} failed", entry.path(), dst))?;
            stats.copied += 1;
        } else {
            tracing::warn!("Skipping special file {:?}", entry.path());
        }
    }
    Ok(dirs)
}

/// Makes `dst` another name for `first`. Returns false when it already was.
fn link_to(first: &Path, dst: &Path, dst_md: Option<&Metadata>) -> Result<bool> {
    let first_md = fs::symlink_metadata(first)?;
    if dst_md.is_some_and(|md| md.dev() == first_md.dev() && md.ino() == first_md.ino()) {
        return Ok(false);
    }
    if dst_md.is_some() {
        fs::remove_file(dst)?;
    }
    fs::hard_link(first, dst)
        .map_err(Error::from)
        .with_msg(format!("Linking {:?} to {:?} failed", dst, first))?;
    Ok(true)
}

/// Read-only version of the sync's own change test: true when `dest` holds exactly the
/// non-excluded entries of `source`, files match by size, mtime and permission bits, and
/// symlinks by target.
pub fn is_in_sync(source: &Path, dest: &Path, excludes: &[String]) -> Result<bool> {
    let matcher = ExcludeMatcher::new(excludes)?;
    let mut expected = 0usize;
    for entry in included(source, &matcher) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source)?;
        let src_md = entry.metadata()?;
        let Ok(dst_md) = fs::symlink_metadata(dest.join(rel)) else {
            return Ok(false);
        };
        let same = if src_md.is_dir() {
            dst_md.is_dir()
        } else if src_md.file_type().is_symlink() {
            dst_md.file_type().is_symlink()
                && fs::read_link(entry.path())? == fs::read_link(dest.join(rel))?
        } else if src_md.is_file() {
            dst_md.is_file() && is_unchanged(&src_md, &dst_md)
        } else {
            // special files are never copied
            continue;
        };
        if !same {
            return Ok(false);
        }
        expected += 1;
    }

    let mut found = 0usize;
    for entry in WalkDir::new(dest).follow_links(false).min_depth(1) {
        entry?;
        found += 1;
    }
    Ok(found == expected)
}

fn is_unchanged(src: &Metadata, dst: &Metadata) -> bool {
    src.len() == dst.len()
        && src.permissions().mode() == dst.permissions().mode()
        && matches!((src.modified(), dst.modified()), (Ok(a), Ok(b)) if a == b)
}

fn replace_file(src: &Path, dst: &Path, src_md: &Metadata) -> Result<()> {
    let dir = dst.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".ysnap-sync")
        .tempfile_in(dir)?;
    std::io::copy(&mut File::open(src)?, tmp.as_file_mut())?;
    tmp.as_file().set_permissions(src_md.permissions())?;
    tmp.as_file().set_modified(src_md.modified()?)?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}

fn ensure_writable(dir: &Path) -> Result<()> {
    let mut permissions = fs::metadata(dir)?.permissions();
    if permissions.mode() & 0o700 != 0o700 {
        permissions.set_mode(permissions.mode() | 0o700);
        fs::set_permissions(dir, permissions)?;
    }
    Ok(())
}
