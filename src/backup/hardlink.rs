//! Hardlink cloning and comparison of snapshot payload trees.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use std::fs::{self, Permissions};
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recreates the directory structure of `from` under `to` and hardlinks every
/// non-directory entry, so file data is shared with `from` rather than copied.
/// Symlinks are recreated with the same target. `to` must not exist yet.
pub fn clone_tree<P1: AsRef<Path>, P2: AsRef<Path>>(from: P1, to: P2) -> Result<()> {
    let from = from.as_ref();
    let to = to.as_ref();
    if to.exists() {
        return Err(Error::from(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("clone destination {:?} already exists", to),
        )));
    }

    let mut dirs: Vec<(PathBuf, Permissions)> = Vec::new();
    let mut linked = 0usize;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from)?;
        let dst = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir(&dst)
                .map_err(Error::from)
                .with_msg(format!("Creating directory {:?} failed", dst))?;
            dirs.push((dst, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &dst)
                .map_err(Error::from)
                .with_msg(format!("Recreating symlink {:?} failed", dst))?;
        } else {
            fs::hard_link(entry.path(), &dst)
                .map_err(Error::from)
                .with_msg(format!("Hardlinking {:?} to {:?} failed", entry.path(), dst))?;
            linked += 1;
        }
    }

    // Deepest first, so a read-only parent does not block its children.
    for (dir, permissions) in dirs.into_iter().rev() {
        fs::set_permissions(&dir, permissions)?;
    }

    tracing::debug!("Hardlinked {} entries from {:?} into {:?}", linked, from, to);
    Ok(())
}

/// True when both trees list exactly the same entries and every file in `new`
/// is the same inode as its counterpart in `old`. Symlinks compare by target.
pub fn is_hardlinked_replica<P1: AsRef<Path>, P2: AsRef<Path>>(old: P1, new: P2) -> Result<bool> {
    let old = old.as_ref();
    let new = new.as_ref();
    let walk = |root: &Path| {
        WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
    };

    let mut old_iter = walk(old);
    let mut new_iter = walk(new);
    loop {
        let (o, n) = match (old_iter.next(), new_iter.next()) {
            (None, None) => return Ok(true),
            (Some(o), Some(n)) => (o?, n?),
            (Some(o), None) => {
                tracing::debug!("{:?} was removed", o?.path());
                return Ok(false);
            }
            (None, Some(n)) => {
                tracing::debug!("{:?} was added", n?.path());
                return Ok(false);
            }
        };

        if o.path().strip_prefix(old)? != n.path().strip_prefix(new)? {
            tracing::debug!("File lists differ at {:?} / {:?}", o.path(), n.path());
            return Ok(false);
        }

        let (ot, nt) = (o.file_type(), n.file_type());
        let same = if ot.is_dir() || nt.is_dir() {
            ot.is_dir() && nt.is_dir()
        } else if ot.is_symlink() || nt.is_symlink() {
            ot.is_symlink()
                && nt.is_symlink()
                && fs::read_link(o.path())? == fs::read_link(n.path())?
        } else {
            let (om, nm) = (o.metadata()?, n.metadata()?);
            om.dev() == nm.dev() && om.ino() == nm.ino()
        };

        if !same {
            tracing::debug!("{:?} changed", n.path());
            return Ok(false);
        }
    }
}
