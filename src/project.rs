// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::overlay::hash::LayerHash;
use crate::part::{self, Part};
use crate::paths::Paths;

/// A fully loaded project: the topologically sorted part list plus the
/// options and base-layer parameters shared by every step.
#[derive(Debug)]
pub struct Project {
    parts: Vec<Part>,
    pub options: ProjectOptions,
    pub paths: Paths,
    /// Root of the unpacked base image layer, when building on a base
    pub base_layer_dir: Option<PathBuf>,
    /// Digest of the base image layer seeding the overlay hash fold
    pub base_layer_hash: Option<LayerHash>,
    /// Names of partitions when the partition feature is enabled; the
    /// first entry is the default partition
    pub partitions: Option<Vec<String>>,
    overlay_viewers: BTreeSet<String>,
}

impl Project {
    pub fn new(parts: Vec<Part>, options: ProjectOptions, paths: Paths) -> Result<Self, part::Error> {
        let parts = part::sort_parts(parts)?;
        let overlay_viewers = resolve_overlay_viewers(&parts);

        Ok(Self {
            parts,
            options,
            paths,
            base_layer_dir: None,
            base_layer_hash: None,
            partitions: None,
            overlay_viewers,
        })
    }

    pub fn with_base_layer(self, dir: impl Into<PathBuf>, hash: LayerHash) -> Self {
        Self {
            base_layer_dir: Some(dir.into()),
            base_layer_hash: Some(hash),
            ..self
        }
    }

    pub fn with_partitions(self, partitions: Vec<String>) -> Self {
        Self {
            partitions: Some(partitions),
            ..self
        }
    }

    /// Parts in topological order, name order breaking ties
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// A part sees the overlay if it declares overlay parameters or has
    /// an `after` dependency on a part that does, transitively. Resolved
    /// once at load.
    pub fn has_overlay_visibility(&self, part: &Part) -> bool {
        self.overlay_viewers.contains(&part.name)
    }

    pub fn default_partition(&self) -> Option<&str> {
        self.partitions.as_ref().and_then(|p| p.first()).map(String::as_str)
    }
}

fn resolve_overlay_viewers(parts: &[Part]) -> BTreeSet<String> {
    let mut viewers = BTreeSet::new();

    // parts are already sorted, so dependencies are resolved before
    // their dependents
    for part in parts {
        if part.spec.has_overlay() || part.spec.after.iter().any(|dep| viewers.contains(dep)) {
            viewers.insert(part.name.clone());
        }
    }

    viewers
}

/// Project-wide options snapshotted into every step state
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProjectOptions {
    pub arch: String,
    pub project_vars_part_name: Option<String>,
    pub project_vars: BTreeMap<String, ProjectVar>,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_owned(),
            project_vars_part_name: None,
            project_vars: BTreeMap::new(),
        }
    }
}

/// A key/value pair shared between parts, settable once per execution
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProjectVar {
    pub value: String,
    pub updated: bool,
}

impl Default for ProjectVar {
    fn default() -> Self {
        Self {
            value: String::new(),
            updated: false,
        }
    }
}

impl ProjectVar {
    pub fn new(value: impl ToString) -> Self {
        Self {
            value: value.to_string(),
            updated: false,
        }
    }
}
