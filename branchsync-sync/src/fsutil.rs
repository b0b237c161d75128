//! Directory-tree copy used to fork a branch checkout from master.
//!
//! The copy lands in `<dst>.branchsync.tmp` and is renamed into place, so an
//! interrupted copy never leaves a half-populated checkout at `dst`.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{io_err, SyncError};

/// Recursively copy `src` to `dst`. `dst` must not exist.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), SyncError> {
    let tmp = tmp_path(dst);
    if tmp.exists() {
        fs::remove_dir_all(&tmp).map_err(|e| io_err(&tmp, e))?;
    }

    if let Err(err) = copy_into(src, &tmp) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(err);
    }

    if let Err(e) = fs::rename(&tmp, dst) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(io_err(dst, e));
    }
    Ok(())
}

fn tmp_path(dst: &Path) -> PathBuf {
    PathBuf::from(format!("{}.branchsync.tmp", dst.display()))
}

fn copy_into(src: &Path, dst: &Path) -> Result<(), SyncError> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            io_err(path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io_err(entry.path(), std::io::Error::other(e)))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| io_err(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), SyncError> {
    let link = fs::read_link(src).map_err(|e| io_err(src, e))?;
    std::os::unix::fs::symlink(&link, dst).map_err(|e| io_err(dst, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), SyncError> {
    fs::copy(src, dst).map_err(|e| io_err(dst, e))?;
    Ok(())
}
