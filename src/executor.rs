// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Applies planned actions to the work directory.
//!
//! Execution is stateless across actions: each action is dispatched to
//! a per-part handler which performs the work and persists the
//! resulting step state. Actions run strictly in plan order, one at a
//! time; the shared stage and prime areas rely on that.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use log::debug;
use thiserror::Error;

use crate::action::{Action, ActionKind};
use crate::overlay::{self, OverlayDriver};
use crate::packages::{self, PackageRepository};
use crate::part::{self, Part};
use crate::plugin::{self, PluginProvider};
use crate::project::Project;
use crate::sources::{self, SourceProvider};
use crate::state;
use crate::step::Step;
use crate::{fileset, migration, util};

pub mod collisions;
pub mod organize;
pub mod part_handler;
pub mod step_handler;

use self::part_handler::PartHandler;

/// The external collaborators the executor drives: source fetchers,
/// build plugins, package repositories and the overlay mount driver
#[derive(Clone, Copy)]
pub struct Providers<'a> {
    pub sources: &'a dyn SourceProvider,
    pub plugins: &'a dyn PluginProvider,
    pub packages: &'a dyn PackageRepository,
    pub overlay: &'a dyn OverlayDriver,
}

pub struct Executor<'a> {
    project: &'a Project,
    providers: Providers<'a>,
    handlers: HashMap<String, PartHandler<'a>>,
}

impl<'a> Executor<'a> {
    pub fn new(project: &'a Project, providers: Providers<'a>) -> Self {
        Self {
            project,
            providers,
            handlers: HashMap::new(),
        }
    }

    /// Execute actions in the order given
    pub fn execute(&mut self, actions: &[Action]) -> Result<(), Error> {
        for action in actions {
            self.run_action(action)?;
        }
        Ok(())
    }

    /// Clean the given step and all later steps for the selected parts.
    /// Without explicit part names the project-wide directories are
    /// removed as well.
    pub fn clean(&mut self, initial_step: Step, part_names: Option<&[String]>) -> Result<(), Error> {
        let project = self.project;
        let selected = part::part_list_by_name(part_names, project.parts())?;

        let mut steps: Vec<Step> = [initial_step]
            .into_iter()
            .chain(initial_step.next_steps().iter().copied())
            .collect();
        steps.reverse();

        for &part in &selected {
            let handler = self.handler(part)?;
            for step in &steps {
                handler.clean_step(*step)?;
            }
        }

        if part_names.is_none() {
            util::remove_any(&project.paths.prime_dir())?;
            if initial_step <= Step::Stage {
                util::remove_any(&project.paths.stage_dir())?;
            }
            if initial_step <= Step::Pull {
                util::remove_any(&project.paths.parts_dir())?;
                util::remove_any(&project.paths.overlay_dir())?;
            }
        }

        Ok(())
    }

    fn run_action(&mut self, action: &Action) -> Result<(), Error> {
        let project = self.project;

        debug!("execute action {action}");

        if action.kind == ActionKind::Skip {
            debug!(
                "skip {}:{} ({})",
                action.part_name,
                action.step.key(),
                action.reason.as_deref().unwrap_or("no reason")
            );
            return Ok(());
        }

        // shared staging must be collision-free before anything lands
        if action.step == Step::Stage {
            collisions::check_for_stage_collisions(project)?;
        }

        let part = part::part_by_name(&action.part_name, project.parts())?;
        self.handler(part)?.run_action(action)
    }

    fn handler(&mut self, part: &'a Part) -> Result<&mut PartHandler<'a>, Error> {
        if !self.handlers.contains_key(&part.name) {
            let handler = PartHandler::new(part, self.project, self.providers)?;
            self.handlers.insert(part.name.clone(), handler);
        }

        Ok(self
            .handlers
            .get_mut(&part.name)
            .expect("handler inserted above"))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("'{scriptlet}' of part '{part_name}' exited with code {exit_code}")]
    ScriptletRun {
        part_name: String,
        scriptlet: String,
        exit_code: i32,
    },
    #[error("build of part '{part_name}' failed")]
    PluginBuild { part_name: String },
    #[error("parts '{first_part}' and '{second_part}' stage different content at {path:?}")]
    StageCollision {
        path: PathBuf,
        first_part: String,
        second_part: String,
    },
    #[error("stage package not found for part '{part_name}': {package}")]
    StagePackageNotFound { part_name: String, package: String },
    #[error("overlay package not found for part '{part_name}': {package}")]
    OverlayPackageNotFound { part_name: String, package: String },
    #[error("part '{part_name}' cannot organize {path:?} to {target:?}: target already exists")]
    OrganizeConflict {
        part_name: String,
        path: PathBuf,
        target: PathBuf,
    },
    #[error("part lookup")]
    Part(#[from] part::Error),
    #[error("plugin")]
    Plugin(#[from] plugin::Error),
    #[error("source")]
    Source(#[from] sources::Error),
    #[error("packages")]
    Packages(#[from] packages::Error),
    #[error("fileset")]
    Fileset(#[from] fileset::Error),
    #[error("migration")]
    Migration(#[from] migration::Error),
    #[error("overlay")]
    Overlay(#[from] overlay::Error),
    #[error("state")]
    State(#[from] state::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
