// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Why a step must run again.
//!
//! Dirty and outdated are distinct failure modes of incremental build:
//! dirty means inputs changed and the step must be cleaned and redone,
//! outdated means the inputs are fresh but the step hasn't absorbed
//! them yet.

use itertools::Itertools;

use crate::step::Step;

/// A part and step that are a prerequisite to another step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub part_name: String,
    pub step: Step,
}

/// Explains why a step is outdated: an earlier step ran again, or the
/// source changed on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutdatedReport {
    pub previous_step_modified: Option<Step>,
    pub source_modified: bool,
}

impl OutdatedReport {
    pub fn reason(&self) -> String {
        let mut reasons = vec![];

        if let Some(step) = self.previous_step_modified {
            reasons.push(format!("'{step}' step"));
        }

        if self.source_modified {
            reasons.push("source".to_owned());
        }

        if reasons.is_empty() {
            return String::new();
        }

        format!("{} changed", humanize_list(&reasons))
    }
}

/// Explains why a step is dirty: properties, project options, or
/// restaged dependencies. At least one field is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyReport {
    pub dirty_properties: Vec<String>,
    pub dirty_project_options: Vec<String>,
    pub changed_dependencies: Vec<Dependency>,
}

impl DirtyReport {
    pub fn reason(&self) -> String {
        let mut reasons = vec![];

        let reason_count = [
            !self.dirty_properties.is_empty(),
            !self.dirty_project_options.is_empty(),
            !self.changed_dependencies.is_empty(),
        ]
        .iter()
        .filter(|b| **b)
        .count();

        // Be specific only when there is a single cause
        if !self.dirty_properties.is_empty() {
            if reason_count > 1 || self.dirty_properties.len() > 1 {
                reasons.push("properties".to_owned());
            } else {
                reasons.push(format!("'{}' property", self.dirty_properties[0]));
            }
        }

        if !self.dirty_project_options.is_empty() {
            if reason_count > 1 || self.dirty_project_options.len() > 1 {
                reasons.push("options".to_owned());
            } else {
                reasons.push(format!("'{}' option", self.dirty_project_options[0]));
            }
        }

        if !self.changed_dependencies.is_empty() {
            if reason_count > 1 || self.changed_dependencies.len() > 1 {
                reasons.push("dependencies".to_owned());
            } else {
                let dependency = &self.changed_dependencies[0];
                reasons.push(format!(
                    "{} for part '{}'",
                    dependency.step.key(),
                    dependency.part_name
                ));
            }
        }

        if reasons.is_empty() {
            return String::new();
        }

        format!("{} changed", humanize_list(&reasons))
    }
}

fn humanize_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [head @ .., last] => format!("{}, and {last}", head.iter().join(", ")),
    }
}
