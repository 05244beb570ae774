// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::fmt;

use crate::project::ProjectVar;
use crate::step::Step;

/// How an action should be carried out by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ActionKind {
    /// Execute the step's built-in handler from scratch
    Run,
    /// Clean this step and all later steps of the part, then execute
    Rerun,
    /// The step is already satisfied; emitted so the executor can
    /// propagate project variables
    Skip,
    /// Re-import changed inputs from an earlier step without discarding
    /// downstream state. Only legal for pull, overlay and build.
    Update,
    /// Wipe and rebuild the part's layer directory while preserving its
    /// recorded state. Only legal for overlay.
    Reapply,
}

/// One scheduled operation on a single (part, step) pair.
///
/// The sequencer emits actions in execution order; the executor consumes
/// them one at a time. The record is immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub part_name: String,
    pub step: Step,
    pub kind: ActionKind,
    pub reason: Option<String>,
    pub project_vars: Option<BTreeMap<String, ProjectVar>>,
}

impl Action {
    pub fn new(part_name: impl ToString, step: Step, kind: ActionKind) -> Self {
        Self {
            part_name: part_name.to_string(),
            step,
            kind,
            reason: None,
            project_vars: None,
        }
    }

    pub fn with_reason(self, reason: impl ToString) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..self
        }
    }

    pub fn with_project_vars(self, project_vars: Option<BTreeMap<String, ProjectVar>>) -> Self {
        Self { project_vars, ..self }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind, self.part_name, self.step.key())?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}
