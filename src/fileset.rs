// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Include/exclude pattern lists resolved against a directory into the
//! concrete file and directory sets migrated between lifecycle steps.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use fs_err as fs;
use glob::Pattern;
use thiserror::Error;

/// An ordered list of path patterns. Entries beginning with `-` are
/// excludes, everything else is an include; a leading `\` escapes a
/// literal `-`. Absolute paths are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fileset {
    name: String,
    entries: Vec<String>,
}

impl Fileset {
    pub fn new(name: impl ToString, entries: Vec<String>) -> Result<Self, Error> {
        let name = name.to_string();

        for entry in &entries {
            let path = entry.strip_prefix('-').unwrap_or(entry);
            let path = path.strip_prefix('\\').unwrap_or(path);
            if Path::new(path).is_absolute() {
                return Err(Error::Absolute {
                    fileset: name,
                    path: path.to_owned(),
                });
            }
        }

        Ok(Self { name, entries })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn includes(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| !e.starts_with('-'))
            .map(|e| e.strip_prefix('\\').unwrap_or(e))
            .collect()
    }

    pub fn excludes(&self) -> Vec<&str> {
        self.entries.iter().filter_map(|e| e.strip_prefix('-')).collect()
    }

    /// Merge entries from another fileset.
    ///
    /// The union is only taken if this fileset has a `*` wildcard or
    /// consists solely of excludes. An include of ours excluded by the
    /// other fileset is a conflict.
    pub fn combine(&mut self, other: &Fileset) -> Result<(), Error> {
        let mut to_combine = false;

        if self.entries.iter().any(|e| e == "*") {
            to_combine = true;
            self.entries.retain(|e| e != "*");
        }

        let other_excludes: BTreeSet<&str> = other.excludes().into_iter().collect();
        let contradicting: BTreeSet<String> = self
            .includes()
            .into_iter()
            .filter(|i| other_excludes.contains(i))
            .map(ToOwned::to_owned)
            .collect();

        if !contradicting.is_empty() {
            return Err(Error::Conflict(contradicting));
        }

        if !self.entries.is_empty() && self.entries.iter().all(|e| e.starts_with('-')) {
            to_combine = true;
        }

        if to_combine {
            for entry in other.entries() {
                if !self.entries.contains(entry) {
                    self.entries.push(entry.clone());
                }
            }
        }

        Ok(())
    }
}

/// Resolve a fileset against `srcdir` into the relative `(files, dirs)`
/// pair to migrate. Parent directories of every selected file are
/// included, with symlink-safe resolution of parents only.
///
/// `default_partition` enables the partition feature: bare entries are
/// assigned to the default partition and only entries matching
/// `partition` are selected. Supplying one without the other is an
/// error.
pub fn migratable_filesets(
    fileset: &Fileset,
    srcdir: &Path,
    default_partition: Option<&str>,
    partition: Option<&str>,
) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>), Error> {
    let (includes, excludes) = file_list(fileset, default_partition, partition)?;

    let include_files = generate_include_set(srcdir, &includes)?;
    let (exclude_files, exclude_dirs) = generate_exclude_set(srcdir, &excludes)?;

    let mut files: BTreeSet<PathBuf> = include_files.difference(&exclude_files).cloned().collect();
    files.retain(|f| !exclude_dirs.iter().any(|d| f.starts_with(d)));

    // Separate dirs from files
    let mut dirs: BTreeSet<PathBuf> = files
        .iter()
        .filter(|f| {
            let abs = srcdir.join(f);
            abs.is_dir() && !abs.is_symlink()
        })
        .cloned()
        .collect();
    files.retain(|f| !dirs.contains(f));

    let srcdir_resolved = fs::canonicalize(srcdir).unwrap_or_else(|_| srcdir.to_path_buf());

    // Every ancestor of a selected file is migrated as well
    for file in &files {
        let resolved = resolved_relative(file, srcdir, &srcdir_resolved);
        let mut parent = resolved.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }

    let resolved_dirs = dirs
        .iter()
        .map(|d| resolved_relative(d, srcdir, &srcdir_resolved))
        .collect();
    let resolved_files = files
        .iter()
        .map(|f| resolved_relative(f, srcdir, &srcdir_resolved))
        .collect();

    Ok((resolved_files, resolved_dirs))
}

/// Split a fileset into include and exclude pattern lists, applying
/// partition selection. Empty includes default to everything.
fn file_list(
    fileset: &Fileset,
    default_partition: Option<&str>,
    partition: Option<&str>,
) -> Result<(Vec<String>, Vec<String>), Error> {
    match (default_partition, partition) {
        (Some(_), None) => {
            return Err(Error::Feature(
                "a partition must be provided if the partition feature is enabled".to_owned(),
            ));
        }
        (None, Some(_)) => {
            return Err(Error::Feature(
                "the partition feature must be enabled if a partition is provided".to_owned(),
            ));
        }
        _ => {}
    }

    let select = |patterns: Vec<&str>| -> Vec<String> {
        let Some(partition) = partition else {
            return patterns.into_iter().map(ToOwned::to_owned).collect();
        };
        let default = default_partition.expect("checked above");

        patterns
            .into_iter()
            .filter_map(|entry| {
                let (entry_partition, inner) = partition_and_path(entry, default);
                (entry_partition == partition).then(|| inner.to_owned())
            })
            .collect()
    };

    let mut includes = select(fileset.includes());
    let excludes = select(fileset.excludes());

    if includes.is_empty() {
        includes.push("*".to_owned());
    }

    Ok((includes, excludes))
}

/// Split `(partition)/path` entries; bare entries belong to the default
/// partition.
fn partition_and_path<'a>(entry: &'a str, default_partition: &'a str) -> (&'a str, &'a str) {
    if let Some(rest) = entry.strip_prefix('(') {
        if let Some((partition, inner)) = rest.split_once(")/") {
            return (partition, inner);
        }
    }

    (default_partition, entry)
}

fn generate_include_set(srcdir: &Path, includes: &[String]) -> Result<BTreeSet<PathBuf>, Error> {
    let mut matched = BTreeSet::new();

    for include in includes {
        if include.contains('*') {
            let mut hits = rglob(srcdir, include)?;

            // Strip hidden siblings matched by a non-hidden pattern
            if !include.starts_with('.') {
                let escaped = Pattern::escape(&srcdir.to_string_lossy());
                let hidden: Vec<PathBuf> = glob::glob(&format!("{escaped}/.{include}"))?.flatten().collect();
                for hidden_path in &hidden {
                    hits.retain(|p| p != hidden_path && !p.starts_with(hidden_path));
                }
            }

            matched.extend(hits);
        } else {
            matched.insert(srcdir.join(include));
        }
    }

    // Expand included directories so an exclude like `*/*.so` still
    // matches files brought in by an include like `lib`
    let dirs: Vec<PathBuf> = matched
        .iter()
        .filter(|p| p.is_dir() && !p.is_symlink())
        .cloned()
        .collect();
    for dir in dirs {
        walk_into(&dir, &mut matched)?;
    }

    Ok(matched
        .into_iter()
        .filter_map(|p| p.strip_prefix(srcdir).map(Path::to_path_buf).ok())
        .collect())
}

fn generate_exclude_set(srcdir: &Path, excludes: &[String]) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>), Error> {
    let mut matched = BTreeSet::new();

    for exclude in excludes {
        matched.extend(rglob(srcdir, exclude)?);
    }

    let exclude_dirs = matched
        .iter()
        .filter(|p| p.is_dir())
        .filter_map(|p| p.strip_prefix(srcdir).map(Path::to_path_buf).ok())
        .collect();
    let exclude_files = matched
        .into_iter()
        .filter_map(|p| p.strip_prefix(srcdir).map(Path::to_path_buf).ok())
        .collect();

    Ok((exclude_files, exclude_dirs))
}

/// Match a pattern at any depth under `dir`
fn rglob(dir: &Path, pattern: &str) -> Result<BTreeSet<PathBuf>, Error> {
    let escaped = Pattern::escape(&dir.to_string_lossy());

    let mut matched = BTreeSet::new();
    for full in [format!("{escaped}/{pattern}"), format!("{escaped}/**/{pattern}")] {
        matched.extend(glob::glob(&full)?.flatten());
    }

    Ok(matched)
}

fn walk_into(dir: &Path, matched: &mut BTreeSet<PathBuf>) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;

        matched.insert(path.clone());
        if meta.is_dir() {
            walk_into(&path, matched)?;
        }
    }

    Ok(())
}

/// Resolve the parents of a relative path against `base`, without
/// following the leaf itself if it is a symlink.
fn resolved_relative(rel: &Path, base: &Path, base_resolved: &Path) -> PathBuf {
    let parent = rel.parent().unwrap_or_else(|| Path::new(""));

    let Ok(parent_abs) = fs::canonicalize(base.join(parent)) else {
        return rel.to_path_buf();
    };

    let leaf_abs = match rel.file_name() {
        Some(name) => parent_abs.join(name),
        None => parent_abs,
    };

    leaf_abs
        .strip_prefix(base_resolved)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| rel.to_path_buf())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fileset {fileset:?}: path {path:?} must be relative")]
    Absolute { fileset: String, path: String },
    #[error("fileset conflict: {0:?}")]
    Conflict(BTreeSet<String>),
    #[error("{0}")]
    Feature(String),
    #[error("invalid pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn fileset(entries: &[&str]) -> Fileset {
        Fileset::new("test", entries.iter().map(|s| (*s).to_owned()).collect()).unwrap()
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("usr/bin/tool"), "tool").unwrap();
        fs::write(root.join("usr/lib/libfoo.so"), "lib").unwrap();
        fs::write(root.join("usr/lib/libfoo.a"), "static").unwrap();
        fs::write(root.join("etc/config"), "cfg").unwrap();
        fs::write(root.join(".hidden"), "dot").unwrap();

        dir
    }

    fn rel(paths: &BTreeSet<PathBuf>) -> Vec<String> {
        paths.iter().map(|p| p.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn rejects_absolute_paths() {
        let result = Fileset::new("stage", vec!["/usr/bin".to_owned()]);
        assert!(matches!(result, Err(Error::Absolute { .. })));

        let result = Fileset::new("stage", vec!["-/usr/bin".to_owned()]);
        assert!(matches!(result, Err(Error::Absolute { .. })));
    }

    #[test]
    fn escaped_hyphen_is_an_include() {
        let set = fileset(&["\\-dashed"]);
        assert_eq!(set.includes(), ["-dashed"]);
        assert!(set.excludes().is_empty());
    }

    #[test]
    fn wildcard_selects_everything_but_hidden() {
        let dir = fixture();
        let (files, dirs) = migratable_filesets(&fileset(&["*"]), dir.path(), None, None).unwrap();

        let files = rel(&files);
        assert!(files.contains(&"usr/bin/tool".to_owned()));
        assert!(files.contains(&"etc/config".to_owned()));
        assert!(!files.contains(&".hidden".to_owned()));

        let dirs = rel(&dirs);
        assert!(dirs.contains(&"usr/lib".to_owned()));
    }

    #[test]
    fn excludes_remove_matches() {
        let dir = fixture();
        let (files, _) = migratable_filesets(&fileset(&["*", "-usr/lib/*.a"]), dir.path(), None, None).unwrap();

        let files = rel(&files);
        assert!(files.contains(&"usr/lib/libfoo.so".to_owned()));
        assert!(!files.contains(&"usr/lib/libfoo.a".to_owned()));
    }

    #[test]
    fn excluded_dir_drops_contents() {
        let dir = fixture();
        let (files, dirs) = migratable_filesets(&fileset(&["*", "-usr/lib"]), dir.path(), None, None).unwrap();

        let files = rel(&files);
        assert!(!files.contains(&"usr/lib/libfoo.so".to_owned()));
        assert!(files.contains(&"usr/bin/tool".to_owned()));
        assert!(!rel(&dirs).contains(&"usr/lib".to_owned()));
    }

    #[test]
    fn include_dir_brings_parents_and_contents() {
        let dir = fixture();
        let (files, dirs) = migratable_filesets(&fileset(&["usr/bin"]), dir.path(), None, None).unwrap();

        assert_eq!(rel(&files), ["usr/bin/tool"]);
        let dirs = rel(&dirs);
        assert!(dirs.contains(&"usr".to_owned()));
        assert!(dirs.contains(&"usr/bin".to_owned()));
    }

    #[test]
    fn combine_unions_through_wildcard() {
        let mut prime = fileset(&["*"]);
        prime.combine(&fileset(&["usr/bin", "-usr/lib"])).unwrap();

        assert!(prime.entries().contains(&"usr/bin".to_owned()));
        assert!(prime.entries().contains(&"-usr/lib".to_owned()));
        assert!(!prime.entries().contains(&"*".to_owned()));
    }

    #[test]
    fn combine_rejects_contradiction() {
        let mut prime = fileset(&["usr/bin"]);
        let result = prime.combine(&fileset(&["-usr/bin"]));
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn combine_excludes_only_unions() {
        let mut prime = fileset(&["-usr/lib"]);
        prime.combine(&fileset(&["etc"])).unwrap();
        assert!(prime.entries().contains(&"etc".to_owned()));
    }

    #[test]
    fn partition_mismatch_is_rejected() {
        let dir = fixture();

        let result = migratable_filesets(&fileset(&["*"]), dir.path(), Some("default"), None);
        assert!(matches!(result, Err(Error::Feature(_))));

        let result = migratable_filesets(&fileset(&["*"]), dir.path(), None, Some("default"));
        assert!(matches!(result, Err(Error::Feature(_))));
    }

    #[test]
    fn partition_prefix_selects_entries() {
        let dir = fixture();

        let set = fileset(&["(default)/usr/bin", "(boot)/etc"]);
        let (files, _) = migratable_filesets(&set, dir.path(), Some("default"), Some("default")).unwrap();
        assert_eq!(rel(&files), ["usr/bin/tool"]);

        let (files, _) = migratable_filesets(&set, dir.path(), Some("default"), Some("boot")).unwrap();
        assert_eq!(rel(&files), ["etc/config"]);
    }

    #[test]
    fn bare_entries_default_partition() {
        let dir = fixture();

        let set = fileset(&["etc"]);
        let (files, _) = migratable_filesets(&set, dir.path(), Some("default"), Some("default")).unwrap();
        assert_eq!(rel(&files), ["etc/config"]);
    }
}
