// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Detect parts staging different content at the same path before any
//! stage action runs.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use sha1::{Digest, Sha1};

use super::Error;
use crate::fileset::{self, Fileset};
use crate::project::Project;

pub fn check_for_stage_collisions(project: &Project) -> Result<(), Error> {
    let mut owners: BTreeMap<PathBuf, (String, PathBuf)> = BTreeMap::new();

    for part in project.parts() {
        let install_dir = project.paths.part(&part.name).install_dir();
        if !install_dir.is_dir() {
            continue;
        }

        let stage_fileset = Fileset::new("stage", part.spec.stage_files.clone())?;
        let (files, _) = fileset::migratable_filesets(
            &stage_fileset,
            &install_dir,
            project.default_partition(),
            project.default_partition(),
        )?;

        for file in files {
            let abs = install_dir.join(&file);

            if let Some((other_part, other_abs)) = owners.get(&file) {
                if !same_content(&abs, other_abs)? {
                    return Err(Error::StageCollision {
                        path: file,
                        first_part: other_part.clone(),
                        second_part: part.name.clone(),
                    });
                }
            } else {
                owners.insert(file, (part.name.clone(), abs));
            }
        }
    }

    Ok(())
}

fn same_content(a: &Path, b: &Path) -> Result<bool, io::Error> {
    let (Ok(meta_a), Ok(meta_b)) = (fs::symlink_metadata(a), fs::symlink_metadata(b)) else {
        // a missing side cannot collide
        return Ok(true);
    };

    if meta_a.is_symlink() != meta_b.is_symlink() {
        return Ok(false);
    }

    if meta_a.is_symlink() {
        return Ok(fs::read_link(a)? == fs::read_link(b)?);
    }

    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    Ok(digest(a)? == digest(b)?)
}

fn digest(path: &Path) -> Result<[u8; 20], io::Error> {
    let mut hasher = Sha1::new();
    hasher.update(fs::read(path)?);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::part::{Part, PartSpec};
    use crate::paths::Paths;
    use crate::project::ProjectOptions;

    fn project_with_installs(dir: &Path, entries: &[(&str, &str, &str)]) -> Project {
        let mut parts = vec![];
        for (part, _, _) in entries {
            if !parts.iter().any(|p: &Part| p.name == *part) {
                parts.push(Part::new(*part, PartSpec::default()));
            }
        }

        let project = Project::new(parts, ProjectOptions::default(), Paths::new(dir)).unwrap();

        for (part, file, content) in entries {
            let path = project.paths.part(part).install_dir().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }

        project
    }

    #[test]
    fn identical_content_is_not_a_collision() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_installs(
            dir.path(),
            &[("foo", "usr/shared", "same"), ("bar", "usr/shared", "same")],
        );

        check_for_stage_collisions(&project).unwrap();
    }

    #[test]
    fn differing_content_collides() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_installs(
            dir.path(),
            &[("foo", "usr/shared", "one"), ("bar", "usr/shared", "two")],
        );

        let result = check_for_stage_collisions(&project);
        assert!(matches!(result, Err(Error::StageCollision { path, .. }) if path == PathBuf::from("usr/shared")));
    }

    #[test]
    fn disjoint_paths_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_installs(dir.path(), &[("foo", "usr/a", "a"), ("bar", "usr/b", "b")]);

        check_for_stage_collisions(&project).unwrap();
    }
}
