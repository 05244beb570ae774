// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Overlay stack support: the mount driver capability, whiteout and
//! opaque-directory recognition, and visibility of layer contents over
//! an already populated destination.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use fs_err as fs;
use log::warn;
use thiserror::Error;

pub mod hash;

/// OCI marker file denoting an opaque directory
pub const OCI_OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Prefix of OCI whiteout marker files
pub const OCI_WHITEOUT_PREFIX: &str = ".wh.";

/// Errors reported by an [`OverlayDriver`] implementation
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Mounts and unmounts the overlay stack. Implemented by the caller;
/// typically backed by overlayfs or fuse-overlayfs.
pub trait OverlayDriver {
    /// Mount `lower_dirs` (topmost first) under `upper_dir` onto
    /// `mountpoint`, using `work_dir` as the overlayfs work area
    fn mount(&self, lower_dirs: &[PathBuf], upper_dir: &Path, work_dir: &Path, mountpoint: &Path)
        -> Result<(), DriverError>;

    fn unmount(&self, mountpoint: &Path) -> Result<(), DriverError>;
}

/// Scoped overlay mount: unmounts when dropped, error paths included
pub struct OverlayMount<'a> {
    driver: &'a dyn OverlayDriver,
    mountpoint: PathBuf,
}

impl<'a> OverlayMount<'a> {
    pub fn new(
        driver: &'a dyn OverlayDriver,
        lower_dirs: &[PathBuf],
        upper_dir: &Path,
        work_dir: &Path,
        mountpoint: &Path,
    ) -> Result<Self, Error> {
        driver
            .mount(lower_dirs, upper_dir, work_dir, mountpoint)
            .map_err(Error::Mount)?;

        Ok(Self {
            driver,
            mountpoint: mountpoint.to_path_buf(),
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl Drop for OverlayMount<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.driver.unmount(&self.mountpoint) {
            warn!("failed to unmount overlay at {:?}: {e}", self.mountpoint);
        }
    }
}

/// Whether a directory entry represents a deleted file.
///
/// Overlayfs materializes deletions as 0:0 character devices; layers
/// produced by archive extraction carry OCI `.wh.` markers instead.
pub fn is_whiteout_file(path: &Path) -> bool {
    if is_oci_whiteout_name(path) {
        return true;
    }

    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };

    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// Whether a directory hides lower-layer content entirely.
///
/// Overlayfs marks these with the `trusted.overlay.opaque=y` xattr; the
/// OCI rendition is a `.wh..wh..opq` marker inside the directory.
pub fn is_opaque_dir(path: &Path) -> bool {
    if path.join(OCI_OPAQUE_MARKER).exists() {
        return true;
    }

    read_xattr(path, "trusted.overlay.opaque").is_some_and(|value| value.as_slice() == b"y".as_slice())
}

pub fn is_oci_whiteout_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(OCI_WHITEOUT_PREFIX))
}

/// The OCI whiteout marker name hiding `name`
pub fn oci_whiteout_name(name: &str) -> String {
    format!("{OCI_WHITEOUT_PREFIX}{name}")
}

/// The name hidden by an OCI whiteout marker, unless it is the opaque
/// marker
pub fn whited_out_name(marker: &str) -> Option<&str> {
    if marker == OCI_OPAQUE_MARKER {
        return None;
    }

    marker.strip_prefix(OCI_WHITEOUT_PREFIX)
}

/// Determine the entries of a layer directory still visible over a
/// partially populated destination.
///
/// Layers are migrated top-down, so an entry is hidden if the
/// destination already provides it, whites it out, or holds an opaque
/// ancestor directory. Returned paths are relative to `layer_dir`, with
/// whiteout devices named by their OCI translation.
pub fn visible_in_layer(
    layer_dir: &Path,
    dest_dir: &Path,
) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>), std::io::Error> {
    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();

    visit_layer_dir(layer_dir, dest_dir, Path::new(""), &mut files, &mut dirs)?;

    Ok((files, dirs))
}

fn visit_layer_dir(
    layer_dir: &Path,
    dest_dir: &Path,
    rel: &Path,
    files: &mut BTreeSet<PathBuf>,
    dirs: &mut BTreeSet<PathBuf>,
) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(layer_dir.join(rel))? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;

        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(ToOwned::to_owned) else {
            continue;
        };

        // A whiteout in the destination hides this entry
        let dest_parent = dest_dir.join(rel);
        if dest_parent.join(oci_whiteout_name(&name)).exists() {
            continue;
        }

        if meta.is_dir() && !meta.is_symlink() {
            let entry_rel = rel.join(&name);
            let dest_path = dest_parent.join(&name);

            match fs::symlink_metadata(&dest_path) {
                Ok(dest_meta) if !dest_meta.is_dir() => {
                    // shadowed by a higher-layer non-directory
                    continue;
                }
                Ok(_) if is_opaque_dir(&dest_path) => {
                    // higher layer replaced the directory wholesale
                    continue;
                }
                Ok(_) => {
                    visit_layer_dir(layer_dir, dest_dir, &entry_rel, files, dirs)?;
                }
                Err(_) => {
                    dirs.insert(entry_rel.clone());
                    visit_layer_dir(layer_dir, dest_dir, &entry_rel, files, dirs)?;
                }
            }
        } else {
            // whiteout devices surface under their OCI name
            let dest_name = if is_whiteout_file(&path) && !name.starts_with(OCI_WHITEOUT_PREFIX) {
                oci_whiteout_name(&name)
            } else {
                name
            };

            if dest_parent.join(&dest_name).exists() {
                continue;
            }

            files.insert(rel.join(dest_name));
        }
    }

    Ok(())
}

fn read_xattr(path: &Path, name: &str) -> Option<Vec<u8>> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let c_name = CString::new(name).ok()?;

    let mut buf = [0u8; 128];
    let len = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };

    (len >= 0).then(|| buf[..len as usize].to_vec())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("mount overlay")]
    Mount(#[source] DriverError),
    #[error("unmount overlay")]
    Unmount(#[source] DriverError),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn whiteout_names() {
        assert_eq!(oci_whiteout_name("file"), ".wh.file");
        assert_eq!(whited_out_name(".wh.file"), Some("file"));
        assert_eq!(whited_out_name(".wh..wh..opq"), None);
        assert_eq!(whited_out_name("file"), None);
    }

    #[test]
    fn marker_files_are_whiteouts() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join(".wh.gone");
        fs::write(&marker, "").unwrap();

        assert!(is_whiteout_file(&marker));
        assert!(!is_whiteout_file(&dir.path().join("absent")));
    }

    #[test]
    fn opaque_marker_detection() {
        let dir = tempfile::tempdir().unwrap();
        let opaque = dir.path().join("replaced");
        fs::create_dir_all(&opaque).unwrap();

        assert!(!is_opaque_dir(&opaque));
        fs::write(opaque.join(OCI_OPAQUE_MARKER), "").unwrap();
        assert!(is_opaque_dir(&opaque));
    }

    #[test]
    fn visibility_respects_destination() {
        let root = tempfile::tempdir().unwrap();
        let layer = root.path().join("layer");
        let dest = root.path().join("dest");

        fs::create_dir_all(layer.join("usr/bin")).unwrap();
        fs::write(layer.join("usr/bin/tool"), "lower").unwrap();
        fs::write(layer.join("usr/bin/other"), "lower").unwrap();
        fs::write(layer.join(".wh.removed"), "").unwrap();

        // higher layer already provides `tool` and whites out `other`
        fs::create_dir_all(dest.join("usr/bin")).unwrap();
        fs::write(dest.join("usr/bin/tool"), "upper").unwrap();
        fs::write(dest.join("usr/bin/.wh.other"), "").unwrap();

        let (files, dirs) = visible_in_layer(&layer, &dest).unwrap();

        assert!(files.contains(&PathBuf::from(".wh.removed")));
        assert!(!files.contains(&PathBuf::from("usr/bin/tool")));
        assert!(!files.contains(&PathBuf::from("usr/bin/other")));
        // directories already present are not re-recorded
        assert!(!dirs.contains(&PathBuf::from("usr")));
    }

    #[test]
    fn opaque_destination_hides_subtree() {
        let root = tempfile::tempdir().unwrap();
        let layer = root.path().join("layer");
        let dest = root.path().join("dest");

        fs::create_dir_all(layer.join("etc")).unwrap();
        fs::write(layer.join("etc/old-config"), "lower").unwrap();

        fs::create_dir_all(dest.join("etc")).unwrap();
        fs::write(dest.join("etc").join(OCI_OPAQUE_MARKER), "").unwrap();

        let (files, _) = visible_in_layer(&layer, &dest).unwrap();
        assert!(files.is_empty());
    }
}
