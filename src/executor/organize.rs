// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Move or rename files within a part's install directory after build.
//!
//! Keys of the organize mapping are globs relative to the install
//! directory; values are destination paths. A value ending in `/`, or
//! a glob matching several sources, moves matches into the destination
//! directory. Existing destinations are an error unless overwriting is
//! allowed (the build update path).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs_err as fs;
use glob::Pattern;
use log::debug;

use super::Error;
use crate::util;

pub fn organize_files(
    part_name: &str,
    mapping: &BTreeMap<String, String>,
    base_dir: &Path,
    overwrite: bool,
) -> Result<(), Error> {
    let escaped = Pattern::escape(&base_dir.to_string_lossy());

    for (src_pattern, dst_spec) in mapping {
        let matches: Vec<PathBuf> = glob::glob(&format!("{escaped}/{src_pattern}"))
            .map_err(crate::fileset::Error::Pattern)?
            .flatten()
            .collect();

        for src in &matches {
            let into_dir = dst_spec.ends_with('/') || matches.len() > 1;

            let dst = if into_dir {
                let Some(file_name) = src.file_name() else {
                    continue;
                };
                base_dir.join(dst_spec.trim_end_matches('/')).join(file_name)
            } else {
                base_dir.join(dst_spec)
            };

            if let Some(parent) = dst.parent() {
                util::ensure_dir_exists(parent)?;
            }

            if fs::symlink_metadata(&dst).is_ok() {
                if !overwrite {
                    return Err(Error::OrganizeConflict {
                        part_name: part_name.to_owned(),
                        path: src.strip_prefix(base_dir).unwrap_or(src).to_path_buf(),
                        target: dst.strip_prefix(base_dir).unwrap_or(&dst).to_path_buf(),
                    });
                }
                util::remove_any(&dst)?;
            }

            debug!("organize: {src:?} -> {dst:?}");
            fs::rename(src, &dst)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapping(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn single_file_rename() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello"), "x").unwrap();

        organize_files("foo", &mapping(&[("hello", "usr/bin/hello")]), dir.path(), false).unwrap();

        assert!(dir.path().join("usr/bin/hello").is_file());
        assert!(!dir.path().join("hello").exists());
    }

    #[test]
    fn glob_moves_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.conf"), "a").unwrap();
        fs::write(dir.path().join("b.conf"), "b").unwrap();

        organize_files("foo", &mapping(&[("*.conf", "etc/")]), dir.path(), false).unwrap();

        assert!(dir.path().join("etc/a.conf").is_file());
        assert!(dir.path().join("etc/b.conf").is_file());
    }

    #[test]
    fn conflict_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello"), "new").unwrap();
        fs::create_dir_all(dir.path().join("usr")).unwrap();
        fs::write(dir.path().join("usr/hello"), "old").unwrap();

        let result = organize_files("foo", &mapping(&[("hello", "usr/hello")]), dir.path(), false);
        assert!(matches!(result, Err(Error::OrganizeConflict { .. })));

        organize_files("foo", &mapping(&[("hello", "usr/hello")]), dir.path(), true).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("usr/hello")).unwrap(), "new");
    }
}
