// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    io,
    num::NonZeroUsize,
    os::unix::fs::{symlink, MetadataExt, PermissionsExt},
    path::Path,
    process::Command,
    thread,
};

use fs_err as fs;
use log::trace;
use nix::unistd::{chown, linkat, Gid, LinkatFlags, Uid};

pub fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn recreate_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Remove a directory entry of any kind, tolerating its absence
pub fn remove_any(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }

    Ok(())
}

/// Recursively copy a directory tree, preserving symlinks
pub fn copy_dir(source_dir: &Path, out_dir: &Path) -> io::Result<()> {
    recreate_dir(out_dir)?;

    let contents = fs::read_dir(source_dir)?;

    for entry in contents.flatten() {
        let path = entry.path();

        if let Some(file_name) = path.file_name() {
            let dest = out_dir.join(file_name);
            let meta = fs::symlink_metadata(&path)?;

            if meta.is_dir() {
                copy_dir(&path, &dest)?;
            } else if meta.is_file() {
                fs::copy(&path, &dest)?;
            } else if meta.is_symlink() {
                symlink(fs::read_link(&path)?, &dest)?;
            }
        }
    }

    Ok(())
}

/// Copy a tree over an existing one without removing destination
/// entries, overwriting files in place
pub fn sync_dir(source_dir: &Path, out_dir: &Path) -> io::Result<()> {
    ensure_dir_exists(out_dir)?;

    for entry in fs::read_dir(source_dir)?.flatten() {
        let path = entry.path();

        if let Some(file_name) = path.file_name() {
            let dest = out_dir.join(file_name);
            let meta = fs::symlink_metadata(&path)?;

            if meta.is_dir() {
                sync_dir(&path, &dest)?;
            } else if meta.is_file() {
                fs::copy(&path, &dest)?;
            } else if meta.is_symlink() {
                remove_any(&dest)?;
                symlink(fs::read_link(&path)?, &dest)?;
            }
        }
    }

    Ok(())
}

pub fn hardlink_or_copy(from: &Path, to: &Path) -> io::Result<()> {
    // Attempt hard link
    let link_result = linkat(None, from, None, to, LinkatFlags::NoSymlinkFollow);

    // Copy instead
    if link_result.is_err() {
        let meta = fs::symlink_metadata(from)?;
        if meta.is_symlink() {
            symlink(fs::read_link(from)?, to)?;
        } else {
            fs::copy(from, to)?;
        }
    }

    Ok(())
}

/// Create `dst` with the mode, owner and group of `src`.
///
/// An existing destination directory keeps its metadata untouched.
pub fn create_similar_directory(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.is_dir() {
        return Ok(());
    }

    fs::create_dir_all(dst)?;

    let meta = fs::symlink_metadata(src)?;
    fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))?;

    // Ownership transfer needs privileges we may not have
    if let Err(e) = chown(dst, Some(Uid::from_raw(meta.uid())), Some(Gid::from_raw(meta.gid()))) {
        trace!("unable to preserve ownership of {dst:?}: {e}");
    }

    Ok(())
}

pub fn num_cpus() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or_else(|_| NonZeroUsize::new(1).unwrap())
}

/// Kernel and machine identification recorded in build manifests
pub fn uname() -> Option<String> {
    let output = Command::new("uname").arg("-srm").output().ok()?;

    if !output.status.success() {
        return None;
    }

    Some(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}
