// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Moving file sets between step directories.
//!
//! Files are hard-linked whenever possible and copied otherwise. The
//! shared stage and prime areas pool content from every part, so
//! cleaning must only remove entries owned by a single part; overlay
//! layer content is translated to OCI whiteout form on the way in.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use log::{debug, warn};
use thiserror::Error;

use crate::overlay;
use crate::state::MigrationState;
use crate::util;

/// Behavior switches for [`migrate_files`]
#[derive(Default)]
pub struct MigrateOptions<'a> {
    /// Silently skip files missing from the source directory
    pub missing_ok: bool,
    /// Migrate symlink targets instead of the symlinks themselves
    pub follow_symlinks: bool,
    /// Translate overlayfs whiteouts and opaque directories to OCI
    /// marker files
    pub oci_translation: bool,
    /// Applied to every migrated file, e.g. pkg-config path rewriting
    pub fixup: Option<&'a dyn Fn(&Path) -> io::Result<()>>,
}

/// Migrate a pre-computed fileset from `srcdir` to `destdir`.
///
/// Directories are created first in lexicographic order, preserving
/// source metadata without touching existing destination directories.
/// A destination entry that is already a symlink is left alone: its
/// provenance was established by a previous part.
///
/// Returns the realized `(files, dirs)` sets for the caller to record
/// in step state; whiteouts appear under their translated names.
pub fn migrate_files(
    files: &BTreeSet<PathBuf>,
    dirs: &BTreeSet<PathBuf>,
    srcdir: &Path,
    destdir: &Path,
    options: &MigrateOptions<'_>,
) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>), Error> {
    let mut migrated_files = BTreeSet::new();
    let mut migrated_dirs = BTreeSet::new();

    for dir in dirs {
        let src = srcdir.join(dir);
        let dst = destdir.join(dir);

        util::create_similar_directory(&src, &dst)?;
        migrated_dirs.insert(dir.clone());

        if options.oci_translation && overlay::is_opaque_dir(&src) {
            let marker = dir.join(overlay::OCI_OPAQUE_MARKER);
            fs::write(destdir.join(&marker), "")?;
            migrated_files.insert(marker);
        }
    }

    for file in files {
        let src = srcdir.join(file);

        // Whiteouts carry no content; they become (or remain) OCI
        // marker files at the destination
        if options.oci_translation {
            if let Some(marker) = whiteout_marker(srcdir, file) {
                let dst = destdir.join(&marker);
                if !dst.exists() {
                    fs::write(&dst, "")?;
                }
                migrated_files.insert(marker);
                continue;
            }
        }

        let src_meta = match fs::symlink_metadata(&src) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound && options.missing_ok => continue,
            Err(e) => return Err(Error::Io(e)),
        };

        let dst = destdir.join(file);

        // If the file is already here and it's a symlink, leave it alone
        if fs::symlink_metadata(&dst).is_ok_and(|meta| meta.is_symlink()) {
            migrated_files.insert(file.clone());
            continue;
        }

        util::remove_any(&dst)?;

        if options.follow_symlinks && src_meta.is_symlink() {
            fs::copy(&src, &dst)?;
        } else {
            util::hardlink_or_copy(&src, &dst)?;
        }

        if let Some(fixup) = options.fixup {
            fixup(&dst)?;
        }

        migrated_files.insert(file.clone());
    }

    Ok((migrated_files, migrated_dirs))
}

/// The OCI marker to create at the destination if `file` denotes a
/// whiteout. The fileset may name the whiteout by its source form (an
/// overlayfs character device) or by its already translated OCI name
/// backed by either representation.
fn whiteout_marker(srcdir: &Path, file: &Path) -> Option<PathBuf> {
    let src = srcdir.join(file);
    let name = file.file_name().and_then(|n| n.to_str())?;

    if overlay::is_whiteout_file(&src) {
        return if name.starts_with(overlay::OCI_WHITEOUT_PREFIX) {
            Some(file.to_path_buf())
        } else {
            Some(file.with_file_name(overlay::oci_whiteout_name(name)))
        };
    }

    // OCI-named entry whose source still carries the raw overlayfs form
    if let Some(hidden) = overlay::whited_out_name(name) {
        let raw = srcdir.join(file.with_file_name(hidden));
        if overlay::is_whiteout_file(&raw) {
            return Some(file.to_path_buf());
        }
    }

    None
}

/// Remove from `shared_dir` the entries owned exclusively by
/// `part_name`.
///
/// Entries listed in any other part's state, or in the overlay
/// migration state, are left in place. Empty directories are removed
/// deepest-first; missing entries are tolerated.
pub fn clean_shared_area(
    part_name: &str,
    shared_dir: &Path,
    part_states: &BTreeMap<String, MigrationState>,
    overlay_state: Option<&MigrationState>,
) -> Result<(), Error> {
    // no state recorded for this part, nothing to remove
    let Some(state) = part_states.get(part_name) else {
        return Ok(());
    };

    let mut files = state.files.clone();
    let mut dirs = state.directories.clone();

    for (other_name, other_state) in part_states {
        if other_name != part_name {
            files = files.difference(&other_state.files).cloned().collect();
            dirs = dirs.difference(&other_state.directories).cloned().collect();
        }
    }

    if let Some(overlay_state) = overlay_state {
        files = files.difference(&overlay_state.files).cloned().collect();
        dirs = dirs.difference(&overlay_state.directories).cloned().collect();
    }

    clean_migrated_files(&files, &dirs, shared_dir)
}

/// Remove overlay-migrated entries from a shared area, keeping anything
/// still listed by a part. Used when the last part with overlay leaves
/// a step.
pub fn clean_shared_overlay(
    shared_dir: &Path,
    part_states: &BTreeMap<String, MigrationState>,
    overlay_state: &MigrationState,
) -> Result<(), Error> {
    let mut files = overlay_state.files.clone();
    let mut dirs = overlay_state.directories.clone();

    for other_state in part_states.values() {
        files = files.difference(&other_state.files).cloned().collect();
        dirs = dirs.difference(&other_state.directories).cloned().collect();
    }

    clean_migrated_files(&files, &dirs, shared_dir)
}

fn clean_migrated_files(files: &BTreeSet<PathBuf>, dirs: &BTreeSet<PathBuf>, directory: &Path) -> Result<(), Error> {
    for file in files {
        match fs::remove_file(directory.join(file)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("attempted to remove file {file:?}, but it didn't exist");
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    // Deepest directories first so empty parents become removable
    for dir in dirs.iter().rev() {
        let migrated = directory.join(dir);

        match fs::read_dir(&migrated) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    fs::remove_dir(&migrated)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("attempted to remove directory {dir:?}, but it didn't exist");
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Ok(())
}

/// Drop whiteouts whose backed entry does not exist in the base layer.
///
/// The sets are pruned in place; the removed marker paths are returned
/// so the caller can unlink them from the destination. Without a base
/// layer every whiteout is dangling.
pub fn filter_dangling_whiteouts(
    files: &mut BTreeSet<PathBuf>,
    base_dir: Option<&Path>,
) -> Vec<PathBuf> {
    let mut dangling = vec![];

    files.retain(|file| {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            return true;
        };

        let backed = if name == overlay::OCI_OPAQUE_MARKER {
            // opaque markers are backed by the directory they sit in
            file.parent().map(Path::to_path_buf)
        } else if let Some(hidden) = overlay::whited_out_name(name) {
            Some(file.with_file_name(hidden))
        } else {
            return true;
        };

        let exists = match (base_dir, backed) {
            (Some(base), Some(path)) => base.join(path).exists(),
            (Some(base), None) => base.exists(),
            (None, _) => false,
        };

        if !exists {
            debug!("dangling whiteout: {file:?}");
            dangling.push(file.clone());
        }

        exists
    });

    dangling
}

/// Remove everything in `destdir` that is not in the keep sets,
/// preserving whiteout markers. Used to apply the overlay file filter
/// to a layer directory.
pub fn apply_file_filter(
    keep_files: &BTreeSet<PathBuf>,
    keep_dirs: &BTreeSet<PathBuf>,
    destdir: &Path,
) -> Result<(), Error> {
    filter_dir(keep_files, keep_dirs, destdir, Path::new(""))
}

fn filter_dir(
    keep_files: &BTreeSet<PathBuf>,
    keep_dirs: &BTreeSet<PathBuf>,
    destdir: &Path,
    rel: &Path,
) -> Result<(), Error> {
    for entry in fs::read_dir(destdir.join(rel))? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;

        let Some(name) = path.file_name() else {
            continue;
        };
        let entry_rel = rel.join(name);

        if meta.is_dir() && !meta.is_symlink() {
            if keep_dirs.contains(&entry_rel) {
                filter_dir(keep_files, keep_dirs, destdir, &entry_rel)?;
            } else {
                debug!("delete dir: {entry_rel:?}");
                fs::remove_dir_all(&path)?;
            }
        } else if !keep_files.contains(&entry_rel) && !overlay::is_whiteout_file(&path) {
            debug!("delete file: {entry_rel:?}");
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("migrate files")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::symlink;

    fn set(paths: &[&str]) -> BTreeSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn migrate_links_files_and_creates_dirs() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("usr/bin/tool"), "tool").unwrap();

        let (files, dirs) = migrate_files(
            &set(&["usr/bin/tool"]),
            &set(&["usr", "usr/bin"]),
            &src,
            &dst,
            &MigrateOptions::default(),
        )
        .unwrap();

        assert!(dst.join("usr/bin/tool").is_file());
        assert_eq!(files, set(&["usr/bin/tool"]));
        assert_eq!(dirs, set(&["usr", "usr/bin"]));
    }

    #[test]
    fn migrate_skips_missing_when_allowed() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();

        let result = migrate_files(&set(&["absent"]), &set(&[]), &src, &dst, &MigrateOptions::default());
        assert!(result.is_err());

        let (files, _) = migrate_files(
            &set(&["absent"]),
            &set(&[]),
            &src,
            &dst,
            &MigrateOptions {
                missing_ok: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn migrate_leaves_destination_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("file"), "new").unwrap();
        fs::write(dst.join("target"), "old").unwrap();
        symlink("target", dst.join("file")).unwrap();

        migrate_files(&set(&["file"]), &set(&[]), &src, &dst, &MigrateOptions::default()).unwrap();

        // the symlink was not replaced
        assert!(fs::symlink_metadata(dst.join("file")).unwrap().is_symlink());
        assert_eq!(fs::read_to_string(dst.join("file")).unwrap(), "old");
    }

    #[test]
    fn migrate_translates_whiteouts() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("layer");
        let dst = root.path().join("stage");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join(".wh.removed"), "").unwrap();

        let (files, _) = migrate_files(
            &set(&[".wh.removed"]),
            &set(&[]),
            &src,
            &dst,
            &MigrateOptions {
                oci_translation: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(dst.join(".wh.removed").is_file());
        assert_eq!(files, set(&[".wh.removed"]));
    }

    #[test]
    fn migrate_preserves_opaque_markers() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("layer");
        let dst = root.path().join("stage");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("etc").join(overlay::OCI_OPAQUE_MARKER), "").unwrap();

        let (files, dirs) = migrate_files(
            &set(&[]),
            &set(&["etc"]),
            &src,
            &dst,
            &MigrateOptions {
                oci_translation: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(dst.join("etc").join(overlay::OCI_OPAQUE_MARKER).is_file());
        assert!(files.contains(&PathBuf::from("etc").join(overlay::OCI_OPAQUE_MARKER)));
        assert_eq!(dirs, set(&["etc"]));
    }

    #[test]
    fn clean_preserves_shared_files() {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("stage");
        fs::create_dir_all(shared.join("usr/bin")).unwrap();
        fs::write(shared.join("usr/bin/own"), "a").unwrap();
        fs::write(shared.join("usr/bin/shared"), "b").unwrap();

        let part_states = BTreeMap::from([
            (
                "foo".to_owned(),
                MigrationState::new(set(&["usr/bin/own", "usr/bin/shared"]), set(&["usr", "usr/bin"])),
            ),
            (
                "bar".to_owned(),
                MigrationState::new(set(&["usr/bin/shared"]), set(&["usr", "usr/bin"])),
            ),
        ]);

        clean_shared_area("foo", &shared, &part_states, None).unwrap();

        assert!(!shared.join("usr/bin/own").exists());
        assert!(shared.join("usr/bin/shared").exists());
        assert!(shared.join("usr/bin").is_dir());
    }

    #[test]
    fn clean_removes_empty_dirs_deepest_first() {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("stage");
        fs::create_dir_all(shared.join("usr/bin")).unwrap();
        fs::write(shared.join("usr/bin/tool"), "t").unwrap();

        let part_states = BTreeMap::from([(
            "foo".to_owned(),
            MigrationState::new(set(&["usr/bin/tool"]), set(&["usr", "usr/bin"])),
        )]);

        clean_shared_area("foo", &shared, &part_states, None).unwrap();

        assert!(!shared.join("usr").exists());
        assert!(shared.exists());
    }

    #[test]
    fn clean_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("stage");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("file"), "x").unwrap();

        let part_states = BTreeMap::from([("foo".to_owned(), MigrationState::new(set(&["file"]), set(&[])))]);

        clean_shared_area("foo", &shared, &part_states, None).unwrap();
        clean_shared_area("foo", &shared, &part_states, None).unwrap();
        assert!(!shared.join("file").exists());
    }

    #[test]
    fn clean_spares_overlay_owned_entries() {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("stage");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("from-overlay"), "o").unwrap();

        let part_states = BTreeMap::from([(
            "foo".to_owned(),
            MigrationState::new(set(&["from-overlay"]), set(&[])),
        )]);
        let overlay_state = MigrationState::new(set(&["from-overlay"]), set(&[]));

        clean_shared_area("foo", &shared, &part_states, Some(&overlay_state)).unwrap();
        assert!(shared.join("from-overlay").exists());

        clean_shared_overlay(&shared, &BTreeMap::new(), &overlay_state).unwrap();
        assert!(!shared.join("from-overlay").exists());
    }

    #[test]
    fn dangling_whiteouts_are_filtered() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("base");
        fs::create_dir_all(base.join("usr")).unwrap();
        fs::write(base.join("usr/present"), "p").unwrap();

        let mut files = set(&["usr/.wh.present", "usr/.wh.gone", "usr/normal"]);
        let dangling = filter_dangling_whiteouts(&mut files, Some(&base));

        assert_eq!(dangling, vec![PathBuf::from("usr/.wh.gone")]);
        assert_eq!(files, set(&["usr/.wh.present", "usr/normal"]));

        // without a base layer, every whiteout is dangling
        let mut files = set(&["usr/.wh.present"]);
        let dangling = filter_dangling_whiteouts(&mut files, None);
        assert_eq!(dangling, vec![PathBuf::from("usr/.wh.present")]);
        assert!(files.is_empty());
    }

    #[test]
    fn file_filter_keeps_only_selected_and_whiteouts() {
        let root = tempfile::tempdir().unwrap();
        let layer = root.path().join("layer");
        fs::create_dir_all(layer.join("keep")).unwrap();
        fs::create_dir_all(layer.join("drop")).unwrap();
        fs::write(layer.join("keep/file"), "k").unwrap();
        fs::write(layer.join("keep/extra"), "x").unwrap();
        fs::write(layer.join(".wh.gone"), "").unwrap();

        apply_file_filter(&set(&["keep/file"]), &set(&["keep"]), &layer).unwrap();

        assert!(layer.join("keep/file").exists());
        assert!(!layer.join("keep/extra").exists());
        assert!(!layer.join("drop").exists());
        assert!(layer.join(".wh.gone").exists());
    }
}
