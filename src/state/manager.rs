// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory view of lifecycle execution state.
//!
//! The database is initialized from state files on disk and maintained
//! only in memory afterwards. Each entry is wrapped with a serial from
//! a monotonically increasing counter: "A is newer than B" is a serial
//! comparison, with on-disk age baked in at load time by inserting
//! states in file mtime order.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use log::{debug, warn};

use crate::part::{self, Part};
use crate::project::{Project, ProjectVar};
use crate::sources::{self, SourceHandler, SourceProvider};
use crate::state::reports::{Dependency, DirtyReport, OutdatedReport};
use crate::state::{self, StepState};
use crate::step::Step;

/// An immutable decoration of [`StepState`] with ordering metadata.
/// Updates produce a fresh wrapper with a new serial; installed
/// wrappers are never mutated.
#[derive(Debug, Clone)]
pub struct StateWrapper {
    pub state: StepState,
    pub serial: u64,
    /// Set when an outdated step has been scheduled for update, so the
    /// same step isn't flagged again before the executor runs
    pub step_updated: bool,
}

impl StateWrapper {
    pub fn is_newer_than(&self, other: &StateWrapper) -> bool {
        self.serial > other.serial
    }
}

/// Mapping of (part, step) to wrapped state, owning the serial counter
#[derive(Debug, Default)]
pub struct StateDb {
    states: HashMap<(String, Step), StateWrapper>,
    serial: u64,
}

impl StateDb {
    pub fn wrap(&mut self, state: StepState, step_updated: bool) -> StateWrapper {
        self.serial += 1;
        StateWrapper {
            state,
            serial: self.serial,
            step_updated,
        }
    }

    pub fn set(&mut self, part_name: &str, step: Step, wrapper: StateWrapper) {
        self.states.insert((part_name.to_owned(), step), wrapper);
    }

    pub fn get(&self, part_name: &str, step: Step) -> Option<&StateWrapper> {
        self.states.get(&(part_name.to_owned(), step))
    }

    pub fn test(&self, part_name: &str, step: Step) -> bool {
        self.get(part_name, step).is_some()
    }

    pub fn remove(&mut self, part_name: &str, step: Step) {
        self.states.remove(&(part_name.to_owned(), step));
    }

    /// Rebind an existing entry with a fresh serial, marking it
    /// recently touched
    pub fn rewrap(&mut self, part_name: &str, step: Step, step_updated: bool) {
        if let Some(wrapper) = self.get(part_name, step) {
            let state = wrapper.state.clone();
            let wrapper = self.wrap(state, step_updated);
            self.set(part_name, step, wrapper);
        }
    }

    pub fn is_step_updated(&self, part_name: &str, step: Step) -> bool {
        self.get(part_name, step).is_some_and(|w| w.step_updated)
    }
}

/// Tells whether a step should run, based on recorded state, the
/// current part specification and the source trees on disk.
pub struct StateManager<'a> {
    db: StateDb,
    project: &'a Project,
    sources: &'a dyn SourceProvider,
    source_handlers: HashMap<String, Option<Box<dyn SourceHandler>>>,
    dirty_cache: HashMap<(String, Step), Option<DirtyReport>>,
}

impl<'a> StateManager<'a> {
    /// Build the database from on-disk state files, inserted in
    /// ascending mtime order so serials reflect file age
    pub fn new(project: &'a Project, sources: &'a dyn SourceProvider) -> Result<Self, state::Error> {
        let mut manager = Self {
            db: StateDb::default(),
            project,
            sources,
            source_handlers: HashMap::new(),
            dirty_cache: HashMap::new(),
        };

        let mut found = vec![];
        for part in project.parts() {
            for step in Step::ALL {
                let path = project.paths.part(&part.name).state_file(*step);
                if let Ok(meta) = path.metadata() {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((part.name.clone(), *step, path, mtime));
                }
            }
        }
        found.sort_by_key(|(_, _, _, mtime)| *mtime);

        for (part_name, step, path, _) in found {
            if let Some(state) = state::load_step_state(&path, step)? {
                manager.set_state(&part_name, step, state);
            }
        }

        Ok(manager)
    }

    pub fn set_state(&mut self, part_name: &str, step: Step, state: StepState) {
        let wrapper = self.db.wrap(state, false);
        self.db.set(part_name, step, wrapper);
        self.dirty_cache.remove(&(part_name.to_owned(), step));
    }

    /// Mark the step as recently modified without changing its state
    pub fn update_state_timestamp(&mut self, part_name: &str, step: Step) {
        self.db.rewrap(part_name, step, false);
    }

    /// Record that an outdated step has been scheduled for update
    pub fn mark_step_updated(&mut self, part_name: &str, step: Step) {
        self.db.rewrap(part_name, step, true);
    }

    /// Drop the state of this step and all later steps of the part
    pub fn clean_part(&mut self, part_name: &str, step: Step) {
        self.db.remove(part_name, step);
        for next in step.next_steps() {
            self.db.remove(part_name, *next);
        }
        self.dirty_cache.remove(&(part_name.to_owned(), step));
    }

    pub fn has_step_run(&self, part: &Part, step: Step) -> bool {
        self.db.test(&part.name, step)
    }

    /// A step should run if it hasn't run, is dirty or outdated, or any
    /// earlier step in the part's lifecycle should run
    pub fn should_step_run(&mut self, part: &Part, step: Step) -> bool {
        if !self.has_step_run(part, step)
            || self.check_if_outdated(part, step).is_some()
            || self.check_if_dirty(part, step).is_some()
        {
            return true;
        }

        if let Some(previous) = step.previous_steps().last() {
            return self.should_step_run(part, *previous);
        }

        false
    }

    /// Project variables recorded at the step's last execution
    pub fn project_vars(&self, part: &Part, step: Step) -> Option<BTreeMap<String, ProjectVar>> {
        let wrapper = self.db.get(&part.name, step)?;
        let vars = wrapper.state.project_vars();

        (!vars.is_empty()).then(|| vars.clone())
    }

    /// Whether an earlier step ran more recently than this one, or the
    /// source changed on disk. A step marked updated never reports
    /// outdated again until its wrapper is replaced.
    pub fn check_if_outdated(&mut self, part: &Part, step: Step) -> Option<OutdatedReport> {
        debug!("check if {}:{step} is outdated", part.name);

        if self.db.is_step_updated(&part.name, step) {
            return None;
        }

        let serial = self.db.get(&part.name, step)?.serial;

        match step {
            Step::Pull => {
                let state_file = self.project.paths.part(&part.name).state_file(step);

                match self.source_handler(part).map(|h| h.check_if_outdated(&state_file)) {
                    Some(Ok(true)) => Some(OutdatedReport {
                        source_modified: true,
                        ..Default::default()
                    }),
                    Some(Err(sources::Error::Unsupported)) | Some(Ok(false)) | None => None,
                    Some(Err(e)) => {
                        warn!("unable to check source of part '{}' for updates: {e}", part.name);
                        None
                    }
                }
            }
            Step::Build => {
                let pull = self.db.get(&part.name, Step::Pull)?;
                (pull.serial > serial).then(|| OutdatedReport {
                    previous_step_modified: Some(Step::Pull),
                    ..Default::default()
                })
            }
            _ => {
                for previous in step.previous_steps().iter().rev() {
                    if let Some(wrapper) = self.db.get(&part.name, *previous) {
                        if wrapper.serial > serial {
                            return Some(OutdatedReport {
                                previous_step_modified: Some(*previous),
                                ..Default::default()
                            });
                        }
                    }
                }
                None
            }
        }
    }

    /// Whether properties or project options of interest changed since
    /// the step ran, or a dependency has been re-staged. Results are
    /// memoized.
    pub fn check_if_dirty(&mut self, part: &Part, step: Step) -> Option<DirtyReport> {
        debug!("check if {}:{step} is dirty", part.name);

        let key = (part.name.clone(), step);
        if let Some(report) = self.dirty_cache.get(&key) {
            return report.clone();
        }

        // the recorded snapshot against the current spec
        let (serial, properties, options) = {
            let wrapper = self.db.get(&part.name, step)?;
            let properties = wrapper.state.diff_properties_of_interest(&part.spec.marshal());
            let options = wrapper.state.diff_project_options_of_interest(&self.project.options);
            (wrapper.serial, properties, options)
        };

        if !properties.is_empty() || !options.is_empty() {
            let report = DirtyReport {
                dirty_properties: properties,
                dirty_project_options: options,
                ..Default::default()
            };
            self.dirty_cache.insert(key, Some(report.clone()));
            return Some(report);
        }

        let Some(prerequisite_step) = step.dependency_prerequisite() else {
            self.dirty_cache.insert(key, None);
            return None;
        };

        // the part itself is clean, check its dependencies
        let project = self.project;
        let mut changed_dependencies = vec![];

        for dependency in part::part_dependencies(part, project.parts()) {
            let dependency_changed = match self.db.get(&dependency.name, prerequisite_step) {
                Some(prerequisite) => prerequisite.serial > serial,
                None => true,
            };

            if dependency_changed || self.should_step_run(dependency, prerequisite_step) {
                changed_dependencies.push(Dependency {
                    part_name: dependency.name.clone(),
                    step: prerequisite_step,
                });
            }
        }

        let report = (!changed_dependencies.is_empty()).then_some(DirtyReport {
            changed_dependencies,
            ..Default::default()
        });

        self.dirty_cache.insert(key, report.clone());
        report
    }

    /// The overlay stack hash recorded in the build or stage state
    pub fn step_state_overlay_hash(&self, part: &Part, step: Step) -> Vec<u8> {
        let Some(wrapper) = self.db.get(&part.name, step) else {
            return vec![];
        };

        wrapper
            .state
            .overlay_hash()
            .and_then(|h| hex::decode(h).ok())
            .unwrap_or_default()
    }

    fn source_handler(&mut self, part: &Part) -> Option<&dyn SourceHandler> {
        if !self.source_handlers.contains_key(&part.name) {
            let handler = match self.sources.source_handler(part, &self.project.paths) {
                Ok(handler) => handler,
                Err(e) => {
                    warn!("unable to create source handler for part '{}': {e}", part.name);
                    None
                }
            };
            self.source_handlers.insert(part.name.clone(), handler);
        }

        self.source_handlers
            .get(&part.name)
            .and_then(|h| h.as_deref())
    }
}
