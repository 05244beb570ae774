// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::Step;

/// Snapshot of a part's properties, as recorded in step state files
pub type Properties = serde_yaml::Mapping;

/// A named unit of work with its own source, build and packaging rules.
///
/// Parts are read once at project load and immutable afterwards; identity
/// is the name, unique within a project.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: String,
    pub spec: PartSpec,
}

impl Part {
    pub fn new(name: impl ToString, spec: PartSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
        }
    }
}

/// Declarative description of one part
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PartSpec {
    pub plugin: Option<String>,
    pub source: Option<String>,
    pub source_type: Option<String>,
    pub source_checksum: Option<String>,
    pub source_branch: Option<String>,
    pub source_tag: Option<String>,
    pub source_commit: Option<String>,
    pub source_depth: Option<u32>,
    pub source_subdir: Option<String>,
    pub after: Vec<String>,
    pub stage_packages: Vec<String>,
    pub stage_snaps: Vec<String>,
    pub build_packages: Vec<String>,
    pub build_snaps: Vec<String>,
    pub build_attributes: Vec<String>,
    pub disable_parallel: bool,
    pub overlay_packages: Vec<String>,
    pub overlay_script: Option<String>,
    #[serde(rename = "overlay")]
    pub overlay_files: Vec<String>,
    #[serde(rename = "stage")]
    pub stage_files: Vec<String>,
    #[serde(rename = "prime")]
    pub prime_files: Vec<String>,
    #[serde(rename = "organize")]
    pub organize_files: BTreeMap<String, String>,
    pub override_pull: Option<String>,
    pub override_build: Option<String>,
    pub override_stage: Option<String>,
    pub override_prime: Option<String>,
}

impl Default for PartSpec {
    fn default() -> Self {
        Self {
            plugin: None,
            source: None,
            source_type: None,
            source_checksum: None,
            source_branch: None,
            source_tag: None,
            source_commit: None,
            source_depth: None,
            source_subdir: None,
            after: vec![],
            stage_packages: vec![],
            stage_snaps: vec![],
            build_packages: vec![],
            build_snaps: vec![],
            build_attributes: vec![],
            disable_parallel: false,
            overlay_packages: vec![],
            overlay_script: None,
            overlay_files: default_fileset(),
            stage_files: default_fileset(),
            prime_files: default_fileset(),
            organize_files: BTreeMap::new(),
            override_pull: None,
            override_build: None,
            override_stage: None,
            override_prime: None,
        }
    }
}

fn default_fileset() -> Vec<String> {
    vec!["*".to_owned()]
}

impl PartSpec {
    /// Whether the part declares overlay parameters
    pub fn has_overlay(&self) -> bool {
        !self.overlay_packages.is_empty()
            || self.overlay_script.is_some()
            || self.overlay_files != default_fileset()
    }

    /// The user override script for the given step, if declared
    pub fn scriptlet(&self, step: Step) -> Option<&str> {
        match step {
            Step::Pull => self.override_pull.as_deref(),
            Step::Overlay => self.overlay_script.as_deref(),
            Step::Build => self.override_build.as_deref(),
            Step::Stage => self.override_stage.as_deref(),
            Step::Prime => self.override_prime.as_deref(),
        }
    }

    /// Snapshot the spec into the mapping form stored in state files
    pub fn marshal(&self) -> Properties {
        match serde_yaml::to_value(self) {
            Ok(serde_yaml::Value::Mapping(mapping)) => mapping,
            _ => Properties::new(),
        }
    }
}

/// Sort parts topologically by their `after` edges, name order breaking
/// ties. Cycles and references to unknown parts are rejected.
pub fn sort_parts(parts: Vec<Part>) -> Result<Vec<Part>, Error> {
    let mut graph = DiGraph::<usize, ()>::new();
    let mut index_of = HashMap::new();

    for (i, part) in parts.iter().enumerate() {
        if index_of.contains_key(part.name.as_str()) {
            return Err(Error::DuplicatePart(part.name.clone()));
        }
        index_of.insert(part.name.as_str(), graph.add_node(i));
    }

    for part in &parts {
        for dep in &part.spec.after {
            let Some(dep_node) = index_of.get(dep.as_str()) else {
                return Err(Error::UnknownPart(dep.clone()));
            };
            // dependency precedes dependent
            graph.add_edge(*dep_node, index_of[part.name.as_str()], ());
        }
    }

    // Kahn's algorithm with a name-ordered ready queue for deterministic
    // tie breaking
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BTreeMap<String, NodeIndex> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| (parts[graph[*n]].name.clone(), *n))
        .collect();

    let mut order = vec![];

    while let Some((_, node)) = ready.pop_first() {
        order.push(graph[node]);

        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            let entry = indegree.get_mut(&next).expect("node is in the graph");
            *entry -= 1;
            if *entry == 0 {
                ready.insert(parts[graph[next]].name.clone(), next);
            }
        }
    }

    if order.len() < parts.len() {
        let mut cyclic = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| parts[graph[*n]].name.clone())
            .collect::<Vec<_>>();
        cyclic.sort();

        return Err(Error::Cycle(cyclic.join(", ")));
    }

    let mut parts = parts.into_iter().map(Some).collect::<Vec<_>>();

    Ok(order
        .into_iter()
        .map(|i| parts[i].take().expect("each index appears once"))
        .collect())
}

/// Look up a part by name
pub fn part_by_name<'a>(name: &str, parts: &'a [Part]) -> Result<&'a Part, Error> {
    parts
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::UnknownPart(name.to_owned()))
}

/// Select parts by name, preserving the part list order. All parts are
/// returned if no names are given.
pub fn part_list_by_name<'a>(names: Option<&[String]>, parts: &'a [Part]) -> Result<Vec<&'a Part>, Error> {
    let Some(names) = names else {
        return Ok(parts.iter().collect());
    };

    for name in names {
        part_by_name(name, parts)?;
    }

    Ok(parts.iter().filter(|p| names.contains(&p.name)).collect())
}

/// The transitive closure of a part's `after` dependencies
pub fn part_dependencies<'a>(part: &Part, parts: &'a [Part]) -> Vec<&'a Part> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&str> = part.spec.after.iter().map(String::as_str).collect();

    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.to_owned()) {
            continue;
        }
        if let Ok(dep) = part_by_name(name, parts) {
            queue.extend(dep.spec.after.iter().map(String::as_str));
        }
    }

    parts.iter().filter(|p| seen.contains(&p.name)).collect()
}

/// Parts declaring overlay parameters, in part list order
pub fn parts_with_overlay<'a>(parts: &'a [Part]) -> Vec<&'a Part> {
    parts.iter().filter(|p| p.spec.has_overlay()).collect()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("part {0:?} is defined more than once")]
    DuplicatePart(String),
    #[error("no such part: {0:?}")]
    UnknownPart(String),
    #[error("circular dependency between parts: {0}")]
    Cycle(String),
}
