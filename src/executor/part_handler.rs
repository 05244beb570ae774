// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-part action handling: the built-in behavior of each lifecycle
//! step, the update and reapply variants, and step cleaning.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;

use fs_err as fs;
use log::{debug, warn};

use super::step_handler::{StepContents, StepHandler};
use super::{organize, Error, Providers};
use crate::action::{Action, ActionKind};
use crate::fileset::{self, Fileset};
use crate::migration::{self, MigrateOptions};
use crate::overlay::hash::{fold_layer_hash, LayerHash};
use crate::overlay::{self, OverlayMount};
use crate::packages;
use crate::part::{self, Part};
use crate::paths::PartPaths;
use crate::project::Project;
use crate::sources::SourceHandler;
use crate::state::{
    self, BuildAssets, BuildState, MigrationState, OverlayState, PrimeState, PullAssets, PullState, StageState,
    StepState,
};
use crate::step::Step;
use crate::util;

pub struct PartHandler<'a> {
    part: &'a Part,
    project: &'a Project,
    providers: Providers<'a>,
    plugin: Box<dyn crate::plugin::Plugin>,
    source: Option<Box<dyn SourceHandler>>,
}

impl<'a> PartHandler<'a> {
    pub fn new(part: &'a Part, project: &'a Project, providers: Providers<'a>) -> Result<Self, Error> {
        let plugin = providers.plugins.plugin(part)?;
        let source = providers.sources.source_handler(part, &project.paths)?;

        Ok(Self {
            part,
            project,
            providers,
            plugin,
            source,
        })
    }

    pub fn run_action(&mut self, action: &Action) -> Result<(), Error> {
        match action.kind {
            ActionKind::Skip => Ok(()),
            ActionKind::Update => self.update_action(action),
            ActionKind::Reapply => self.reapply_action(action),
            ActionKind::Rerun => {
                for step in [action.step].iter().chain(action.step.next_steps()) {
                    self.clean_step(*step)?;
                }
                self.run(action.step)
            }
            ActionKind::Run => self.run(action.step),
        }
    }

    fn run(&mut self, step: Step) -> Result<(), Error> {
        let state = match step {
            Step::Pull => self.run_pull()?,
            Step::Overlay => self.run_overlay()?,
            Step::Build => self.run_build(false)?,
            Step::Stage => self.run_stage()?,
            Step::Prime => self.run_prime()?,
        };

        state.write(&self.paths().state_file(step))?;
        Ok(())
    }

    fn run_pull(&mut self) -> Result<StepState, Error> {
        let paths = self.paths();
        let spec = &self.part.spec;

        util::remove_any(&paths.src_dir())?;
        self.make_dirs()?;

        let fetched_packages = self.fetch_stage_packages()?;
        let fetched_snaps = self.fetch_stage_snaps()?;
        self.fetch_overlay_packages()?;

        if let Some(scriptlet) = spec.override_pull.as_deref() {
            self.step_handler()
                .run_scriptlet(scriptlet, "override-pull", &paths.src_dir())?;
        } else {
            self.step_handler().run_builtin(Step::Pull)?;
        }

        Ok(StepState::Pull(PullState {
            part_properties: spec.marshal(),
            project_options: self.project.options.clone(),
            assets: PullAssets {
                stage_packages: fetched_packages,
                stage_snaps: fetched_snaps,
                source_details: self.source.as_deref().and_then(|source| source.source_details()),
            },
        }))
    }

    fn run_overlay(&mut self) -> Result<StepState, Error> {
        let paths = self.paths();
        let spec = &self.part.spec;

        self.make_dirs()?;

        let contents = if spec.has_overlay() {
            // install overlay packages inside the mounted stack
            if !spec.overlay_packages.is_empty() {
                let mount = self.mount_overlay()?;
                self.providers
                    .packages
                    .install_overlay_packages(&spec.overlay_packages, mount.mountpoint())
                    .map_err(|e| match e {
                        packages::Error::PackageNotFound(package) => Error::OverlayPackageNotFound {
                            part_name: self.part.name.clone(),
                            package,
                        },
                        e => e.into(),
                    })?;
            }

            let contents = if let Some(scriptlet) = spec.overlay_script.as_deref() {
                let _mount = self.mount_overlay()?;
                self.step_handler()
                    .run_scriptlet(scriptlet, "overlay-script", &paths.layer_dir())?;
                StepContents::default()
            } else {
                StepContents::default()
            };

            // keep only what the overlay filter selects, preserving
            // whiteouts
            let overlay_fileset = Fileset::new("overlay", spec.overlay_files.clone())?;
            let (files, dirs) = fileset::migratable_filesets(&overlay_fileset, &paths.layer_dir(), None, None)?;
            migration::apply_file_filter(&files, &dirs, &paths.layer_dir())?;

            contents
        } else {
            StepContents::default()
        };

        let layer_hash = self.compute_layer_hash(false);
        layer_hash.save(&paths.layer_hash_file())?;

        Ok(StepState::Overlay(OverlayState {
            part_properties: spec.marshal(),
            project_options: self.project.options.clone(),
            files: contents.files,
            directories: contents.dirs,
        }))
    }

    fn run_build(&mut self, update: bool) -> Result<StepState, Error> {
        let paths = self.paths();
        let spec = &self.part.spec;

        self.make_dirs()?;
        self.unpack_stage_packages()?;
        self.unpack_stage_snaps()?;

        // in-source builds work on a copy of the source tree
        if !update && !self.plugin.out_of_source_build() {
            util::copy_dir(&paths.src_dir(), &paths.build_dir())?;
        }

        if self.project.has_overlay_visibility(self.part) {
            let _mount = self.mount_overlay()?;
            self.run_build_step(&paths)?;
        } else {
            self.run_build_step(&paths)?;
        }

        // organizing here keeps collision detection and stage reruns
        // honest; overwrite is only allowed when updating, so a part
        // can reorganize over its own previous layout
        organize::organize_files(&self.part.name, &spec.organize_files, &paths.install_dir(), update)?;

        let mut build_packages = spec.build_packages.clone();
        build_packages.extend(self.plugin.build_packages());
        let mut build_snaps = spec.build_snaps.clone();
        build_snaps.extend(self.plugin.build_snaps());

        let overlay_hash = self.compute_layer_hash(true);

        Ok(StepState::Build(BuildState {
            part_properties: spec.marshal(),
            project_options: self.project.options.clone(),
            assets: BuildAssets {
                build_packages,
                build_snaps,
                uname: util::uname(),
                installed_packages: self.providers.packages.installed_packages(),
                installed_snaps: self.providers.packages.installed_snaps(),
            },
            overlay_hash: Some(overlay_hash.to_string()),
        }))
    }

    fn run_build_step(&self, paths: &PartPaths) -> Result<(), Error> {
        if let Some(scriptlet) = self.part.spec.override_build.as_deref() {
            self.step_handler()
                .run_scriptlet(scriptlet, "override-build", &paths.build_dir())?;
        } else {
            self.step_handler().run_builtin(Step::Build)?;
        }
        Ok(())
    }

    fn run_stage(&mut self) -> Result<StepState, Error> {
        let spec = &self.part.spec;

        self.make_dirs()?;

        let contents = if let Some(scriptlet) = spec.override_stage.as_deref() {
            self.step_handler()
                .run_scriptlet(scriptlet, "override-stage", &self.project.paths.stage_dir())?;
            StepContents::default()
        } else {
            self.step_handler().run_builtin(Step::Stage)?
        };

        self.migrate_overlay_files_to_stage()?;

        let overlay_hash = self.compute_layer_hash(true);

        Ok(StepState::Stage(StageState {
            part_properties: spec.marshal(),
            project_options: self.project.options.clone(),
            files: contents.files,
            directories: contents.dirs,
            overlay_hash: Some(overlay_hash.to_string()),
        }))
    }

    fn run_prime(&mut self) -> Result<StepState, Error> {
        let spec = &self.part.spec;

        self.make_dirs()?;

        let contents = if let Some(scriptlet) = spec.override_prime.as_deref() {
            self.step_handler()
                .run_scriptlet(scriptlet, "override-prime", &self.project.paths.prime_dir())?;
            StepContents::default()
        } else {
            self.step_handler().run_builtin(Step::Prime)?
        };

        self.migrate_overlay_files_to_prime()?;

        let primed_stage_packages = if !spec.stage_packages.is_empty() && self.providers.packages.is_deb_based() {
            let prime_dir = self.project.paths.prime_dir();
            contents
                .files
                .iter()
                .filter_map(|file| packages::read_origin_stage_package(&prime_dir.join(file)))
                .collect()
        } else {
            BTreeSet::new()
        };

        Ok(StepState::Prime(PrimeState {
            part_properties: spec.marshal(),
            project_options: self.project.options.clone(),
            files: contents.files,
            directories: contents.dirs,
            primed_stage_packages,
        }))
    }

    fn update_action(&mut self, action: &Action) -> Result<(), Error> {
        match action.step {
            Step::Pull => self.update_pull()?,
            // an out of date overlay must not rerun here, or its state
            // would be cleaned and build would rerun instead of update
            Step::Overlay => {}
            Step::Build => self.update_build()?,
            Step::Stage | Step::Prime => {
                return Err(Error::InvalidAction(format!(
                    "cannot update step '{}' of '{}'",
                    action.step.key(),
                    self.part.name
                )));
            }
        }

        // refresh the state file timestamp so a reloaded state manager
        // sees this step as recently run
        let state_file = self.paths().state_file(action.step);
        if state_file.exists() {
            let content = fs::read(&state_file)?;
            fs::write(&state_file, content)?;
        }

        Ok(())
    }

    fn update_pull(&mut self) -> Result<(), Error> {
        self.make_dirs()?;

        if let Some(scriptlet) = self.part.spec.override_pull.as_deref() {
            let src_dir = self.paths().src_dir();
            return self.step_handler().run_scriptlet(scriptlet, "override-pull", &src_dir);
        }

        let Some(source) = self.source.as_deref() else {
            warn!("update requested on part '{}' without a source handler", self.part.name);
            return Ok(());
        };

        source.update()?;
        Ok(())
    }

    fn update_build(&mut self) -> Result<(), Error> {
        let paths = self.paths();

        if !self.plugin.out_of_source_build() {
            // refresh the build tree from the source tree without
            // discarding build artifacts
            util::sync_dir(&paths.src_dir(), &paths.build_dir())?;
        }

        util::remove_any(&paths.install_dir())?;

        self.run_build(true)?;
        Ok(())
    }

    fn reapply_action(&mut self, action: &Action) -> Result<(), Error> {
        if action.step != Step::Overlay {
            return Err(Error::InvalidAction(format!(
                "cannot reapply step '{}' of '{}'",
                action.step.key(),
                self.part.name
            )));
        }

        // rebuild the layer from scratch, keeping the recorded state
        util::remove_any(&self.paths().layer_dir())?;
        self.run_overlay()?;
        Ok(())
    }

    /// Stage overlay layer contents, top layer first, translating
    /// whiteouts to OCI form. Runs once per project execution, gated by
    /// the overlay migration state file.
    fn migrate_overlay_files_to_stage(&self) -> Result<(), Error> {
        let state_path = self.project.paths.overlay_migration_state_file(Step::Stage);

        if state_path.exists() {
            debug!("stage overlay migration state exists, not migrating overlay data");
            return Ok(());
        }

        let parts_with_overlay = part::parts_with_overlay(self.project.parts());
        if !parts_with_overlay.iter().any(|p| p.name == self.part.name) {
            return Ok(());
        }

        debug!("staging overlay files");
        let stage_dir = self.project.paths.stage_dir();
        let (files, dirs) = self.migrate_overlay_layers(&parts_with_overlay, &stage_dir, None)?;

        MigrationState::new(files, dirs).write(&state_path)?;
        Ok(())
    }

    /// Prime the staged overlay contents, dropping whiteouts that hide
    /// nothing in the base layer
    fn migrate_overlay_files_to_prime(&self) -> Result<(), Error> {
        let state_path = self.project.paths.overlay_migration_state_file(Step::Prime);

        if state_path.exists() {
            debug!("prime overlay migration state exists, not migrating overlay data");
            return Ok(());
        }

        let parts_with_overlay = part::parts_with_overlay(self.project.parts());
        if !parts_with_overlay.iter().any(|p| p.name == self.part.name) {
            return Ok(());
        }

        debug!("priming overlay files");
        let prime_dir = self.project.paths.prime_dir();
        let stage_dir = self.project.paths.stage_dir();
        let (mut files, dirs) = self.migrate_overlay_layers(&parts_with_overlay, &prime_dir, Some(&stage_dir))?;

        let dangling = migration::filter_dangling_whiteouts(&mut files, self.project.base_layer_dir.as_deref());
        for whiteout in dangling {
            let primed = prime_dir.join(&whiteout);
            match fs::remove_file(&primed) {
                Ok(()) => debug!("unlinked {primed:?}"),
                Err(e) => debug!("error unlinking {primed:?}: {e}"),
            }
        }

        MigrationState::new(files, dirs).write(&state_path)?;
        Ok(())
    }

    /// Migrate each overlay layer into `dest_dir`, topmost layer first.
    /// Visibility is computed against the destination as it fills, and
    /// content is read from `content_dir` when the layers were already
    /// translated there (priming from stage).
    fn migrate_overlay_layers(
        &self,
        parts_with_overlay: &[&Part],
        dest_dir: &std::path::Path,
        content_dir: Option<&std::path::Path>,
    ) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>), Error> {
        let mut migrated_files = BTreeSet::new();
        let mut migrated_dirs = BTreeSet::new();

        for part in parts_with_overlay.iter().rev() {
            debug!("migrate part '{}' layer to {dest_dir:?}", part.name);

            let layer_dir = self.project.paths.part(&part.name).layer_dir();
            if !layer_dir.is_dir() {
                continue;
            }

            let (files, dirs) = overlay::visible_in_layer(&layer_dir, dest_dir)?;
            let srcdir = content_dir.unwrap_or(&layer_dir);

            let (files, dirs) = migration::migrate_files(
                &files,
                &dirs,
                srcdir,
                dest_dir,
                &MigrateOptions {
                    missing_ok: content_dir.is_some(),
                    oci_translation: true,
                    ..Default::default()
                },
            )?;

            migrated_files.extend(files);
            migrated_dirs.extend(dirs);
        }

        Ok((migrated_files, migrated_dirs))
    }

    pub fn clean_step(&mut self, step: Step) -> Result<(), Error> {
        debug!("clean {}:{}", self.part.name, step.key());

        let paths = self.paths();

        match step {
            Step::Pull => {
                util::remove_any(&paths.stage_packages_dir())?;
                util::remove_any(&paths.stage_snaps_dir())?;
                util::remove_any(&paths.src_dir())?;
            }
            Step::Overlay => {
                util::remove_any(&paths.layer_dir())?;
                util::remove_any(&paths.layer_hash_file())?;
            }
            Step::Build => {
                util::remove_any(&paths.build_dir())?;
                util::remove_any(&paths.install_dir())?;
            }
            Step::Stage => {
                self.clean_shared(Step::Stage, &self.project.paths.stage_dir())?;
            }
            Step::Prime => {
                self.clean_shared(Step::Prime, &self.project.paths.prime_dir())?;
            }
        }

        state::remove_state(&paths.state_file(step))?;
        Ok(())
    }

    fn clean_shared(&self, step: Step, shared_dir: &std::path::Path) -> Result<(), Error> {
        if !shared_dir.is_dir() {
            return Ok(());
        }

        let part_states = self.load_part_states(step)?;
        let migration_state_path = self.project.paths.overlay_migration_state_file(step);
        let overlay_state = MigrationState::read(&migration_state_path)?;

        migration::clean_shared_area(&self.part.name, shared_dir, &part_states, overlay_state.as_ref())?;

        // the last part with overlay at this step takes the overlay
        // data with it
        if self.part.spec.has_overlay() && self.parts_with_overlay_in_step(step).len() == 1 {
            if let Some(overlay_state) = overlay_state {
                migration::clean_shared_overlay(shared_dir, &part_states, &overlay_state)?;
            }
            match fs::remove_file(&migration_state_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn load_part_states(&self, step: Step) -> Result<BTreeMap<String, MigrationState>, Error> {
        let mut part_states = BTreeMap::new();

        for part in self.project.parts() {
            let path = self.project.paths.part(&part.name).state_file(step);
            if let Some(state) = state::load_step_state(&path, step)? {
                if let Some((files, dirs)) = state.contents() {
                    part_states.insert(part.name.clone(), MigrationState::new(files.clone(), dirs.clone()));
                }
            }
        }

        Ok(part_states)
    }

    fn parts_with_overlay_in_step(&self, step: Step) -> Vec<&Part> {
        part::parts_with_overlay(self.project.parts())
            .into_iter()
            .filter(|p| self.project.paths.part(&p.name).state_file(step).is_file())
            .collect()
    }

    fn step_handler(&self) -> StepHandler<'_> {
        StepHandler {
            part: self.part,
            project: self.project,
            plugin: self.plugin.as_ref(),
            source: self.source.as_deref(),
        }
    }

    /// Mount the overlay stack with this part's layer on top
    fn mount_overlay(&self) -> Result<OverlayMount<'a>, Error> {
        let project_paths = &self.project.paths;

        let mut lower_dirs = vec![];
        for part in self.project.parts() {
            if part.name == self.part.name {
                break;
            }
            lower_dirs.push(project_paths.part(&part.name).layer_dir());
        }
        // overlayfs lists the topmost lower layer first
        lower_dirs.reverse();
        if let Some(base) = &self.project.base_layer_dir {
            lower_dirs.push(base.clone());
        }

        for dir in &lower_dirs {
            util::ensure_dir_exists(dir)?;
        }
        util::ensure_dir_exists(&project_paths.overlay_mount_dir())?;
        util::ensure_dir_exists(&project_paths.overlay_work_dir())?;

        Ok(OverlayMount::new(
            self.providers.overlay,
            &lower_dirs,
            &self.paths().layer_dir(),
            &project_paths.overlay_work_dir(),
            &project_paths.overlay_mount_dir(),
        )?)
    }

    fn compute_layer_hash(&self, all_parts: bool) -> LayerHash {
        let base = self.project.base_layer_hash.unwrap_or(LayerHash::ZERO);
        let up_to = (!all_parts).then_some(self.part.name.as_str());

        fold_layer_hash(self.project, up_to, base)
    }

    fn fetch_stage_packages(&self) -> Result<Vec<String>, Error> {
        let stage_packages = &self.part.spec.stage_packages;
        if stage_packages.is_empty() {
            return Ok(vec![]);
        }

        self.providers
            .packages
            .fetch_stage_packages(stage_packages, &self.paths().stage_packages_dir())
            .map_err(|e| match e {
                packages::Error::PackageNotFound(package) => Error::StagePackageNotFound {
                    part_name: self.part.name.clone(),
                    package,
                },
                e => e.into(),
            })
    }

    fn fetch_stage_snaps(&self) -> Result<Vec<String>, Error> {
        let stage_snaps = &self.part.spec.stage_snaps;
        if stage_snaps.is_empty() {
            return Ok(vec![]);
        }

        self.providers
            .packages
            .fetch_stage_snaps(stage_snaps, &self.paths().stage_snaps_dir())?;

        Ok(stage_snaps.clone())
    }

    fn fetch_overlay_packages(&self) -> Result<(), Error> {
        let overlay_packages = &self.part.spec.overlay_packages;
        if overlay_packages.is_empty() {
            return Ok(());
        }

        let cache_dir = self.project.paths.overlay_packages_dir();
        util::ensure_dir_exists(&cache_dir)?;

        self.providers
            .packages
            .download_overlay_packages(overlay_packages, &cache_dir)
            .map_err(|e| match e {
                packages::Error::PackageNotFound(package) => Error::OverlayPackageNotFound {
                    part_name: self.part.name.clone(),
                    package,
                },
                e => e.into(),
            })
    }

    fn unpack_stage_packages(&self) -> Result<(), Error> {
        if self.part.spec.stage_packages.is_empty() {
            return Ok(());
        }

        self.providers
            .packages
            .unpack_stage_packages(&self.paths().stage_packages_dir(), &self.paths().install_dir())?;
        Ok(())
    }

    fn unpack_stage_snaps(&self) -> Result<(), Error> {
        if self.part.spec.stage_snaps.is_empty() {
            return Ok(());
        }

        self.providers
            .packages
            .unpack_stage_snaps(&self.paths().stage_snaps_dir(), &self.paths().install_dir())?;
        Ok(())
    }

    fn make_dirs(&self) -> Result<(), Error> {
        let paths = self.paths();

        for dir in [
            paths.src_dir(),
            paths.build_dir(),
            paths.install_dir(),
            paths.layer_dir(),
            paths.state_dir(),
            paths.run_dir(),
            self.project.paths.stage_dir(),
            self.project.paths.prime_dir(),
            self.project.paths.overlay_dir(),
        ] {
            util::ensure_dir_exists(&dir)?;
        }

        Ok(())
    }

    fn paths(&self) -> PartPaths {
        self.project.paths.part(&self.part.name)
    }
}
