// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! OS package repository capability, plus the file-level fixups applied
//! to migrated package content.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use fs_err as fs;
use thiserror::Error;

/// xattr recording which stage package a migrated file came from
pub const ORIGIN_STAGE_PACKAGE_XATTR: &str = "user.mason.origin-stage-package";

/// Access to the OS package repositories consumed during pull, build
/// and overlay processing. Implemented by the caller.
pub trait PackageRepository {
    /// Resolve the given package names and download them into
    /// `target_dir`. Returns the concrete resolved package list.
    fn fetch_stage_packages(&self, names: &[String], target_dir: &Path) -> Result<Vec<String>, Error>;

    /// Unpack previously fetched packages into the install directory
    fn unpack_stage_packages(&self, package_dir: &Path, install_dir: &Path) -> Result<(), Error>;

    /// Download snaps into `target_dir`
    fn fetch_stage_snaps(&self, names: &[String], target_dir: &Path) -> Result<(), Error>;

    /// Unpack previously fetched snaps into the install directory
    fn unpack_stage_snaps(&self, snap_dir: &Path, install_dir: &Path) -> Result<(), Error>;

    /// Download overlay packages into the shared overlay cache
    fn download_overlay_packages(&self, names: &[String], cache_dir: &Path) -> Result<(), Error>;

    /// Install packages inside a mounted overlay root
    fn install_overlay_packages(&self, names: &[String], overlay_root: &Path) -> Result<(), Error>;

    fn installed_packages(&self) -> Vec<String> {
        vec![]
    }

    fn installed_snaps(&self) -> Vec<String> {
        vec![]
    }

    /// Whether the target system uses deb packaging; gates stage
    /// package origin bookkeeping during prime
    fn is_deb_based(&self) -> bool {
        false
    }
}

/// Rewrite the `prefix=` line of a staged pkg-config file so dependent
/// builds resolve against the staging area instead of the per-part
/// install directory.
pub fn fix_pkg_config(pkg_config_file: &Path, prefix_prepend: &Path, prefix_trim: &Path) -> std::io::Result<()> {
    let content = fs::read_to_string(pkg_config_file)?;

    let mut changed = false;
    let fixed = content
        .lines()
        .map(|line| {
            let Some(value) = line.strip_prefix("prefix=") else {
                return line.to_owned();
            };

            let trimmed = Path::new(value)
                .strip_prefix(prefix_trim)
                .unwrap_or_else(|_| Path::new(value.trim_start_matches('/')));

            changed = true;
            format!("prefix={}", prefix_prepend.join(trimmed).display())
        })
        .collect::<Vec<_>>()
        .join("\n");

    if changed {
        fs::write(pkg_config_file, fixed + "\n")?;
    }

    Ok(())
}

/// The stage package a file originated from, recorded as an xattr at
/// unpack time. Absence is not an error.
pub fn read_origin_stage_package(path: &Path) -> Option<String> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let c_name = CString::new(ORIGIN_STAGE_PACKAGE_XATTR).ok()?;

    let mut buf = [0u8; 256];
    let len = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };

    if len <= 0 {
        return None;
    }

    String::from_utf8(buf[..len as usize].to_vec()).ok()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("failed to fetch packages: {0}")]
    Fetch(String),
    #[error("failed to unpack packages: {0}")]
    Unpack(String),
    #[error("failed to install packages: {0}")]
    Install(String),
    #[error("io")]
    Io(#[from] std::io::Error),
}
