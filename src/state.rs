// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Persisted per-(part, step) records.
//!
//! A state file is written after each run or rerun of a step and removed
//! when the step is cleaned. It snapshots the part properties and
//! project options at the time of the run, plus step-specific payload:
//! fetched assets, migrated file sets, the observed overlay hash.
//! Unknown keys are ignored on read so old engines can read newer files;
//! absent keys default to empty.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::part::Properties;
use crate::project::{ProjectOptions, ProjectVar};
use crate::step::Step;

pub mod manager;
pub mod reports;

/// The files and directories a part (or the overlay migration) placed
/// in a shared area
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MigrationState {
    pub files: BTreeSet<PathBuf>,
    pub directories: BTreeSet<PathBuf>,
}

impl MigrationState {
    pub fn new(files: BTreeSet<PathBuf>, directories: BTreeSet<PathBuf>) -> Self {
        Self { files, directories }
    }

    pub fn read(path: &Path) -> Result<Option<Self>, Error> {
        read_yaml(path)
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        write_yaml(path, self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PullAssets {
    pub stage_packages: Vec<String>,
    pub stage_snaps: Vec<String>,
    pub source_details: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BuildAssets {
    pub build_packages: Vec<String>,
    pub build_snaps: Vec<String>,
    pub uname: Option<String>,
    pub installed_packages: Vec<String>,
    pub installed_snaps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PullState {
    pub part_properties: Properties,
    pub project_options: ProjectOptions,
    pub assets: PullAssets,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OverlayState {
    pub part_properties: Properties,
    pub project_options: ProjectOptions,
    pub files: BTreeSet<PathBuf>,
    pub directories: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BuildState {
    pub part_properties: Properties,
    pub project_options: ProjectOptions,
    pub assets: BuildAssets,
    pub overlay_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StageState {
    pub part_properties: Properties,
    pub project_options: ProjectOptions,
    pub files: BTreeSet<PathBuf>,
    pub directories: BTreeSet<PathBuf>,
    pub overlay_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PrimeState {
    pub part_properties: Properties,
    pub project_options: ProjectOptions,
    pub files: BTreeSet<PathBuf>,
    pub directories: BTreeSet<PathBuf>,
    pub primed_stage_packages: BTreeSet<String>,
}

/// State of one lifecycle step of one part
#[derive(Debug, Clone, PartialEq)]
pub enum StepState {
    Pull(PullState),
    Overlay(OverlayState),
    Build(BuildState),
    Stage(StageState),
    Prime(PrimeState),
}

impl StepState {
    pub fn step(&self) -> Step {
        match self {
            StepState::Pull(_) => Step::Pull,
            StepState::Overlay(_) => Step::Overlay,
            StepState::Build(_) => Step::Build,
            StepState::Stage(_) => Step::Stage,
            StepState::Prime(_) => Step::Prime,
        }
    }

    pub fn part_properties(&self) -> &Properties {
        match self {
            StepState::Pull(s) => &s.part_properties,
            StepState::Overlay(s) => &s.part_properties,
            StepState::Build(s) => &s.part_properties,
            StepState::Stage(s) => &s.part_properties,
            StepState::Prime(s) => &s.part_properties,
        }
    }

    pub fn project_options(&self) -> &ProjectOptions {
        match self {
            StepState::Pull(s) => &s.project_options,
            StepState::Overlay(s) => &s.project_options,
            StepState::Build(s) => &s.project_options,
            StepState::Stage(s) => &s.project_options,
            StepState::Prime(s) => &s.project_options,
        }
    }

    pub fn project_vars(&self) -> &BTreeMap<String, ProjectVar> {
        &self.project_options().project_vars
    }

    /// Files and directories this state contributed to a shared area
    pub fn contents(&self) -> Option<(&BTreeSet<PathBuf>, &BTreeSet<PathBuf>)> {
        match self {
            StepState::Overlay(s) => Some((&s.files, &s.directories)),
            StepState::Stage(s) => Some((&s.files, &s.directories)),
            StepState::Prime(s) => Some((&s.files, &s.directories)),
            StepState::Pull(_) | StepState::Build(_) => None,
        }
    }

    /// The overlay stack hash observed by this step (build and stage
    /// only)
    pub fn overlay_hash(&self) -> Option<&str> {
        match self {
            StepState::Build(s) => s.overlay_hash.as_deref(),
            StepState::Stage(s) => s.overlay_hash.as_deref(),
            _ => None,
        }
    }

    /// Part properties whose change makes this step dirty
    pub fn properties_of_interest(step: Step) -> &'static [&'static str] {
        match step {
            Step::Pull => &[
                "plugin",
                "source",
                "source-type",
                "source-checksum",
                "source-branch",
                "source-tag",
                "source-commit",
                "source-depth",
                "source-subdir",
                "override-pull",
                "stage-packages",
                "stage-snaps",
                "overlay-packages",
            ],
            Step::Overlay => &["overlay-packages", "overlay-script", "overlay"],
            Step::Build => &[
                "after",
                "build-attributes",
                "build-packages",
                "build-snaps",
                "disable-parallel",
                "organize",
                "override-build",
            ],
            Step::Stage => &["stage", "override-stage"],
            Step::Prime => &["prime", "override-prime"],
        }
    }

    /// Project options whose change makes this step dirty
    pub fn project_options_of_interest(step: Step) -> &'static [&'static str] {
        match step {
            Step::Pull | Step::Overlay | Step::Build => &["arch"],
            Step::Stage | Step::Prime => &[],
        }
    }

    /// Names of properties of interest differing from the recorded
    /// snapshot
    pub fn diff_properties_of_interest(&self, current: &Properties) -> Vec<String> {
        let recorded = self.part_properties();

        Self::properties_of_interest(self.step())
            .iter()
            .filter(|key| {
                let key = serde_yaml::Value::from(**key);
                recorded.get(&key) != current.get(&key)
            })
            .map(|key| (*key).to_owned())
            .collect()
    }

    /// Names of project options of interest differing from the recorded
    /// snapshot
    pub fn diff_project_options_of_interest(&self, current: &ProjectOptions) -> Vec<String> {
        let recorded = self.project_options();

        Self::project_options_of_interest(self.step())
            .iter()
            .filter(|key| match **key {
                "arch" => recorded.arch != current.arch,
                _ => false,
            })
            .map(|key| (*key).to_owned())
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        match self {
            StepState::Pull(s) => write_yaml(path, s),
            StepState::Overlay(s) => write_yaml(path, s),
            StepState::Build(s) => write_yaml(path, s),
            StepState::Stage(s) => write_yaml(path, s),
            StepState::Prime(s) => write_yaml(path, s),
        }
    }
}

/// Load the persisted state for a step, if its file exists
pub fn load_step_state(path: &Path, step: Step) -> Result<Option<StepState>, Error> {
    Ok(match step {
        Step::Pull => read_yaml(path)?.map(StepState::Pull),
        Step::Overlay => read_yaml(path)?.map(StepState::Overlay),
        Step::Build => read_yaml(path)?.map(StepState::Build),
        Step::Stage => read_yaml(path)?.map(StepState::Stage),
        Step::Prime => read_yaml(path)?.map(StepState::Prime),
    })
}

/// Remove a state file, tolerating its absence
pub fn remove_state(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    Ok(Some(serde_yaml::from_str(&content)?))
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, serde_yaml::to_string(value)?).map_err(Error::Io)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("state io")]
    Io(#[from] io::Error),
    #[error("decode state")]
    Decode(#[from] serde_yaml::Error),
}
