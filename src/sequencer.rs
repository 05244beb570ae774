// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Turns the current project state into the ordered list of actions
//! realizing a target step.
//!
//! Planning reads persistent state once and updates it entirely in
//! memory; nothing on disk changes until the executor runs the emitted
//! actions. Within one plan, every action's prerequisites appear
//! earlier in the list.

use log::debug;
use thiserror::Error;

use crate::action::{Action, ActionKind};
use crate::overlay::hash::{LayerHash, LayerState};
use crate::part::{self, Part};
use crate::project::Project;
use crate::sources::SourceProvider;
use crate::state::manager::StateManager;
use crate::state::{self, BuildState, OverlayState, PrimeState, PullState, StageState, StepState};
use crate::step::Step;

pub struct Sequencer<'a> {
    project: &'a Project,
    sm: StateManager<'a>,
    layer_state: LayerState,
    actions: Vec<Action>,
}

impl<'a> Sequencer<'a> {
    pub fn new(project: &'a Project, sources: &'a dyn SourceProvider) -> Result<Self, Error> {
        Ok(Self {
            project,
            sm: StateManager::new(project, sources)?,
            layer_state: LayerState::load(project)?,
            actions: vec![],
        })
    }

    /// Determine the actions required to bring the selected parts (all
    /// parts if none are named) to the target step
    pub fn plan(&mut self, target_step: Step, part_names: Option<&[String]>) -> Result<Vec<Action>, Error> {
        self.actions.clear();
        self.add_all_actions(target_step, part_names, None, false)?;
        Ok(std::mem::take(&mut self.actions))
    }

    /// Like [`Sequencer::plan`], but force the target step to run again
    /// for the explicitly named parts
    pub fn plan_rerun(&mut self, target_step: Step, part_names: Option<&[String]>) -> Result<Vec<Action>, Error> {
        self.actions.clear();
        self.add_all_actions(target_step, part_names, None, true)?;
        Ok(std::mem::take(&mut self.actions))
    }

    /// Rebuild the state manager from persistent storage, picking up
    /// what the executor wrote
    pub fn reload_state(&mut self, sources: &'a dyn SourceProvider) -> Result<(), Error> {
        self.sm = StateManager::new(self.project, sources)?;
        self.layer_state = LayerState::load(self.project)?;
        Ok(())
    }

    fn add_all_actions(
        &mut self,
        target_step: Step,
        part_names: Option<&[String]>,
        reason: Option<&str>,
        rerun: bool,
    ) -> Result<(), Error> {
        let project = self.project;
        let selected = part::part_list_by_name(part_names, project.parts())?;

        for current_step in target_step.previous_steps().iter().chain([&target_step]) {
            for &part in &selected {
                debug!("process {}:{current_step}", part.name);
                self.add_step_actions(*current_step, target_step, part, part_names, reason, rerun)?;
            }
        }

        Ok(())
    }

    /// The decision cascade for one (part, step) pair
    fn add_step_actions(
        &mut self,
        current_step: Step,
        target_step: Step,
        part: &'a Part,
        part_names: Option<&[String]>,
        reason: Option<&str>,
        rerun: bool,
    ) -> Result<(), Error> {
        // 1. never ran: run it
        if !self.sm.has_step_run(part, current_step) {
            return self.run_step(part, current_step, reason, false);
        }

        // 2. the caller requested a rerun of exactly this step
        if rerun
            && current_step == target_step
            && part_names.is_some_and(|names| names.contains(&part.name))
        {
            return self.rerun_step(part, current_step, Some(reason.unwrap_or("requested step")));
        }

        // 3. dirty: clean and run again
        if let Some(report) = self.sm.check_if_dirty(part, current_step) {
            debug!("{}:{current_step} is dirty", part.name);
            return self.rerun_step(part, current_step, Some(&report.reason()));
        }

        // 4. the overlay this step observed changed underneath it
        if self.check_overlay_dependencies(part, current_step)? {
            return Ok(());
        }

        // 5. outdated: earlier inputs are fresh but not absorbed yet
        if let Some(report) = self.sm.check_if_outdated(part, current_step) {
            debug!("{}:{current_step} is outdated", part.name);

            if matches!(current_step, Step::Pull | Step::Overlay | Step::Build) {
                self.update_step(part, current_step, &report.reason());
            } else {
                self.rerun_step(part, current_step, Some(&report.reason()))?;
            }

            self.sm.mark_step_updated(&part.name, current_step);
            return Ok(());
        }

        // 6. satisfied; emitted anyway so project variables propagate
        self.add_action(
            Action::new(&part.name, current_step, ActionKind::Skip)
                .with_reason("already ran")
                .with_project_vars(self.sm.project_vars(part, current_step)),
        );

        Ok(())
    }

    fn run_step(&mut self, part: &'a Part, step: Step, reason: Option<&str>, rerun: bool) -> Result<(), Error> {
        self.process_dependencies(part, step)?;

        let project = self.project;

        if step == Step::Overlay {
            // all previous layers must be in place before a new layer
            // joins the stack
            let reason = format!("required to overlay '{}'", part.name);
            let layer_hash = self.ensure_overlay_consistency(part, Some(&reason), true)?;
            self.layer_state.set_layer_hash(&part.name, layer_hash);
        } else if (step == Step::Build && project.has_overlay_visibility(part))
            || (step == Step::Stage && part.spec.has_overlay())
        {
            // the whole overlay stack must be consistent before building
            // a part that sees it or staging a part that contributes to it
            if let Some(last) = project.parts().last() {
                let reason = format!("required to {} '{}'", step.key(), part.name);
                self.ensure_overlay_consistency(last, Some(&reason), false)?;
            }
        }

        let kind = if rerun { ActionKind::Rerun } else { ActionKind::Run };
        let mut action = Action::new(&part.name, step, kind);
        if let Some(reason) = reason {
            action = action.with_reason(reason);
        }
        self.add_action(action);

        // install the resulting state in memory, with the overlay hash
        // captured at this moment
        let part_properties = part.spec.marshal();
        let project_options = project.options.clone();
        let overlay_hash = self
            .layer_state
            .overlay_hash(project)
            .map(|hash| hash.to_string());

        let state = match step {
            Step::Pull => StepState::Pull(PullState {
                part_properties,
                project_options,
                ..Default::default()
            }),
            Step::Overlay => StepState::Overlay(OverlayState {
                part_properties,
                project_options,
                ..Default::default()
            }),
            Step::Build => StepState::Build(BuildState {
                part_properties,
                project_options,
                overlay_hash,
                ..Default::default()
            }),
            Step::Stage => StepState::Stage(StageState {
                part_properties,
                project_options,
                overlay_hash,
                ..Default::default()
            }),
            Step::Prime => StepState::Prime(PrimeState {
                part_properties,
                project_options,
                ..Default::default()
            }),
        };

        self.sm.set_state(&part.name, step, state);

        Ok(())
    }

    /// Clean recorded state and execute the step again. Overlay state
    /// survives a rerun; the layer itself is rebuilt through reapply.
    fn rerun_step(&mut self, part: &'a Part, step: Step, reason: Option<&str>) -> Result<(), Error> {
        debug!("rerun step {}:{step}", part.name);

        if step != Step::Overlay {
            self.sm.clean_part(&part.name, step);
        }

        self.run_step(part, step, reason, true)
    }

    /// Mark the step as re-executed by bumping its serial; no disk
    /// write happens at plan time
    fn update_step(&mut self, part: &Part, step: Step, reason: &str) {
        debug!("update step {}:{step}", part.name);
        self.add_action(Action::new(&part.name, step, ActionKind::Update).with_reason(reason));
        self.sm.update_state_timestamp(&part.name, step);
    }

    /// Record a new layer hash and rebuild the layer without touching
    /// its step state
    fn reapply_layer(&mut self, part: &Part, layer_hash: LayerHash, reason: &str) {
        debug!("reapply layer {}: hash={layer_hash}", part.name);
        self.layer_state.set_layer_hash(&part.name, layer_hash);
        self.add_action(Action::new(&part.name, Step::Overlay, ActionKind::Reapply).with_reason(reason));
    }

    /// Bring every transitive dependency up to the step's prerequisite
    fn process_dependencies(&mut self, part: &'a Part, step: Step) -> Result<(), Error> {
        let Some(prerequisite_step) = step.dependency_prerequisite() else {
            return Ok(());
        };

        let project = self.project;

        for dependency in part::part_dependencies(part, project.parts()) {
            if self.sm.should_step_run(dependency, prerequisite_step) {
                let names = vec![dependency.name.clone()];
                let reason = format!("required to {} '{}'", step.key(), part.name);
                self.add_all_actions(prerequisite_step, Some(&names), Some(&reason), false)?;
            }
        }

        Ok(())
    }

    /// Make sure every layer up to `top_part` matches its recorded
    /// hash, scheduling overlay work for any that doesn't. Returns the
    /// hash computed for `top_part`.
    fn ensure_overlay_consistency(
        &mut self,
        top_part: &Part,
        reason: Option<&str>,
        skip_last: bool,
    ) -> Result<LayerHash, Error> {
        let project = self.project;

        for part in project.parts() {
            let layer_hash = self.layer_state.compute_layer_hash(project, part);

            if !(skip_last && part.name == top_part.name)
                && self.layer_state.layer_hash(&part.name) != Some(layer_hash)
            {
                let names = vec![part.name.clone()];
                self.add_all_actions(Step::Overlay, Some(&names), reason, false)?;
                self.layer_state.set_layer_hash(&part.name, layer_hash);
            }

            if part.name == top_part.name {
                return Ok(layer_hash);
            }
        }

        Err(part::Error::UnknownPart(top_part.name.clone()).into())
    }

    /// Whether the step must be redone because the overlay changed.
    /// Overlay layers reapply, builds and stages rerun.
    fn check_overlay_dependencies(&mut self, part: &'a Part, step: Step) -> Result<bool, Error> {
        let project = self.project;

        match step {
            Step::Overlay => {
                let current = self.layer_state.compute_layer_hash(project, part);

                if self.layer_state.layer_hash(&part.name) != Some(current) {
                    debug!("{}:{step} changed layer hash", part.name);
                    // lower layers must be consistent before this one is
                    // rebuilt on top of them
                    self.ensure_overlay_consistency(part, Some("previous layer changed"), true)?;
                    self.reapply_layer(part, current, "previous layer changed");
                    return Ok(true);
                }
            }
            Step::Build if project.has_overlay_visibility(part) => {
                let current = self.current_overlay_hash();
                let recorded = self.sm.step_state_overlay_hash(part, step);

                if current != recorded {
                    debug!("{}:{step} can see overlay and it changed", part.name);
                    self.rerun_step(part, step, Some("overlay changed"))?;
                    return Ok(true);
                }
            }
            Step::Stage if part.spec.has_overlay() => {
                let current = self.current_overlay_hash();
                let recorded = self.sm.step_state_overlay_hash(part, step);

                if current != recorded {
                    debug!("{}:{step} has overlay and it changed", part.name);
                    self.rerun_step(part, step, Some("overlay changed"))?;
                    return Ok(true);
                }
            }
            _ => {}
        }

        Ok(false)
    }

    fn current_overlay_hash(&self) -> Vec<u8> {
        self.layer_state
            .overlay_hash(self.project)
            .map(|hash| hash.as_bytes().to_vec())
            .unwrap_or_default()
    }

    fn add_action(&mut self, action: Action) {
        debug!("add action {action}");
        self.actions.push(action);
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("part lookup")]
    Part(#[from] part::Error),
    #[error("state")]
    State(#[from] state::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;
    use crate::part::PartSpec;
    use crate::paths::Paths;
    use crate::project::ProjectOptions;
    use crate::sources;

    struct NoSources;

    impl SourceProvider for NoSources {
        fn source_handler(
            &self,
            _part: &Part,
            _paths: &Paths,
        ) -> Result<Option<Box<dyn crate::sources::SourceHandler>>, sources::Error> {
            Ok(None)
        }
    }

    fn project_in(work_dir: &Path, parts: Vec<Part>) -> Project {
        Project::new(parts, ProjectOptions::default(), Paths::new(work_dir)).unwrap()
    }

    fn plain_part(name: &str) -> Part {
        Part::new(name, PartSpec::default())
    }

    fn run(part: &str, step: Step) -> Action {
        Action::new(part, step, ActionKind::Run)
    }

    fn run_because(part: &str, step: Step, reason: &str) -> Action {
        Action::new(part, step, ActionKind::Run).with_reason(reason)
    }

    fn skip(part: &str, step: Step) -> Action {
        Action::new(part, step, ActionKind::Skip).with_reason("already ran")
    }

    fn write_state(project: &Project, part: &Part, step: Step) {
        let part_properties = part.spec.marshal();
        let state = match step {
            Step::Pull => StepState::Pull(PullState {
                part_properties,
                ..Default::default()
            }),
            Step::Overlay => StepState::Overlay(OverlayState {
                part_properties,
                ..Default::default()
            }),
            Step::Build => StepState::Build(BuildState {
                part_properties,
                ..Default::default()
            }),
            Step::Stage => StepState::Stage(StageState {
                part_properties,
                ..Default::default()
            }),
            Step::Prime => StepState::Prime(PrimeState {
                part_properties,
                ..Default::default()
            }),
        };
        state.write(&project.paths.part(&part.name).state_file(step)).unwrap();
    }

    // S1: default plan, no dependencies; topological order with name
    // ties broken alphabetically
    #[test]
    fn plan_prime_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_in(dir.path(), vec![plain_part("foo"), plain_part("bar")]);
        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();

        let actions = sequencer.plan(Step::Prime, None).unwrap();

        assert_eq!(
            actions,
            vec![
                run("bar", Step::Pull),
                run("foo", Step::Pull),
                run("bar", Step::Overlay),
                run("foo", Step::Overlay),
                run("bar", Step::Build),
                run("foo", Step::Build),
                run("bar", Step::Stage),
                run("foo", Step::Stage),
                run("bar", Step::Prime),
                run("foo", Step::Prime),
            ]
        );
    }

    // S2: a dependency inserts its prerequisite stage before the
    // dependent part builds
    #[test]
    fn plan_inserts_dependency_prerequisites() {
        let dir = tempfile::tempdir().unwrap();
        let mut foo = plain_part("foo");
        foo.spec.after = vec!["bar".to_owned()];
        let project = project_in(dir.path(), vec![foo, plain_part("bar")]);
        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();

        let actions = sequencer.plan(Step::Prime, None).unwrap();

        assert_eq!(
            actions,
            vec![
                run("bar", Step::Pull),
                run("foo", Step::Pull),
                run("bar", Step::Overlay),
                run("foo", Step::Overlay),
                run("bar", Step::Build),
                // bar must reach stage before foo can build
                skip("bar", Step::Pull),
                skip("bar", Step::Overlay),
                skip("bar", Step::Build),
                run_because("bar", Step::Stage, "required to build 'foo'"),
                run("foo", Step::Build),
                skip("bar", Step::Stage),
                run("foo", Step::Stage),
                run("bar", Step::Prime),
                run("foo", Step::Prime),
            ]
        );
    }

    // S3: existing pull state matching the current spec is skipped
    #[test]
    fn plan_skips_satisfied_pull() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_in(dir.path(), vec![plain_part("foo"), plain_part("bar")]);

        for part in project.parts() {
            write_state(&project, part, Step::Pull);
        }

        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();
        let actions = sequencer.plan(Step::Build, None).unwrap();

        assert_eq!(
            actions,
            vec![
                skip("bar", Step::Pull),
                skip("foo", Step::Pull),
                run("bar", Step::Overlay),
                run("foo", Step::Overlay),
                run("bar", Step::Build),
                run("foo", Step::Build),
            ]
        );
    }

    // S4: a changed property of interest makes the recorded step dirty
    #[test]
    fn plan_reruns_dirty_pull() {
        let dir = tempfile::tempdir().unwrap();

        let mut recorded = plain_part("foo");
        recorded.spec.plugin = Some("nil".to_owned());
        let mut current = plain_part("foo");
        current.spec.plugin = Some("dump".to_owned());

        let staging = project_in(dir.path(), vec![recorded]);
        write_state(&staging, &staging.parts()[0], Step::Pull);

        let project = project_in(dir.path(), vec![current]);
        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();
        let actions = sequencer.plan(Step::Pull, None).unwrap();

        assert_eq!(
            actions,
            vec![Action::new("foo", Step::Pull, ActionKind::Rerun).with_reason("'plugin' property changed")]
        );
    }

    // S5: a build state older than its pull state is updated in place
    #[test]
    fn plan_updates_outdated_build() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_in(dir.path(), vec![plain_part("foo")]);
        let part = &project.parts()[0];

        write_state(&project, part, Step::Build);
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_state(&project, part, Step::Pull);

        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();
        let actions = sequencer.plan(Step::Build, None).unwrap();

        assert_eq!(
            actions,
            vec![
                skip("foo", Step::Pull),
                run("foo", Step::Overlay),
                Action::new("foo", Step::Build, ActionKind::Update).with_reason("'PULL' step changed"),
            ]
        );
    }

    // S6: an invalidated lower layer is brought back to consistency
    // before the requested part's layer is touched
    #[test]
    fn plan_restores_overlay_consistency() {
        let dir = tempfile::tempdir().unwrap();

        let overlay_part = |name: &str, package: &str| {
            Part::new(
                name,
                PartSpec {
                    overlay_packages: vec![package.to_owned()],
                    ..Default::default()
                },
            )
        };

        // the layer stack as previously applied
        let old = project_in(
            dir.path(),
            vec![overlay_part("one", "old-package"), overlay_part("two", "top")],
        );
        for part in old.parts() {
            write_state(&old, part, Step::Pull);
            write_state(&old, part, Step::Overlay);
        }
        let mut previous = LayerHash::ZERO;
        for part in old.parts() {
            previous = LayerHash::for_part(part, &previous);
            previous.save(&old.paths.part(&part.name).layer_hash_file()).unwrap();
        }

        // part one's overlay parameters changed since
        let current = project_in(
            dir.path(),
            vec![overlay_part("one", "new-package"), overlay_part("two", "top")],
        );
        // the pull state must still match the current spec
        for part in current.parts() {
            write_state(&current, part, Step::Pull);
        }

        let sources = NoSources;
        let mut sequencer = Sequencer::new(&current, &sources).unwrap();
        let two = vec!["two".to_owned()];
        let actions = sequencer.plan(Step::Overlay, Some(&two)).unwrap();

        let one_rerun = actions
            .iter()
            .position(|a| a.part_name == "one" && a.step == Step::Overlay && a.kind == ActionKind::Rerun)
            .expect("part one's overlay must be rerun");
        let two_reapply = actions
            .iter()
            .position(|a| a.part_name == "two" && a.step == Step::Overlay && a.kind == ActionKind::Reapply)
            .expect("part two's layer must be reapplied");

        assert!(one_rerun < two_reapply, "lower layer first: {actions:?}");
        assert_eq!(
            actions[two_reapply].reason.as_deref(),
            Some("previous layer changed")
        );
    }

    // Rerun planning forces the requested step even when satisfied
    #[test]
    fn plan_rerun_forces_requested_step() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_in(dir.path(), vec![plain_part("foo")]);

        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();
        sequencer.plan(Step::Build, None).unwrap();

        // everything is now satisfied in memory
        let names = vec!["foo".to_owned()];
        let actions = sequencer.plan_rerun(Step::Build, Some(&names)).unwrap();

        assert_eq!(
            actions,
            vec![
                skip("foo", Step::Pull),
                skip("foo", Step::Overlay),
                Action::new("foo", Step::Build, ActionKind::Rerun).with_reason("requested step"),
            ]
        );
    }

    // Invariant 1: run/rerun actions respect pipeline order per part
    #[test]
    fn plan_is_monotone_per_part() {
        let dir = tempfile::tempdir().unwrap();
        let mut alpha = plain_part("alpha");
        alpha.spec.after = vec!["beta".to_owned()];
        let project = project_in(dir.path(), vec![alpha, plain_part("beta"), plain_part("gamma")]);

        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();
        let actions = sequencer.plan(Step::Prime, None).unwrap();

        for part in project.parts() {
            let steps: Vec<Step> = actions
                .iter()
                .filter(|a| a.part_name == part.name && matches!(a.kind, ActionKind::Run | ActionKind::Rerun))
                .map(|a| a.step)
                .collect();

            let mut sorted = steps.clone();
            sorted.sort();
            assert_eq!(steps, sorted, "part {} out of order", part.name);
        }
    }

    #[test]
    fn plan_rejects_unknown_parts() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_in(dir.path(), vec![plain_part("foo")]);
        let sources = NoSources;
        let mut sequencer = Sequencer::new(&project, &sources).unwrap();

        let names = vec!["ghost".to_owned()];
        assert!(matches!(
            sequencer.plan(Step::Build, Some(&names)),
            Err(Error::Part(part::Error::UnknownPart(_)))
        ));
    }
}
