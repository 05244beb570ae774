// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in step behavior and user scriptlet execution.
//!
//! Each step either runs its built-in handler or a user override
//! script. Scripts are written to the part's run directory and executed
//! with a generated environment exporting the part and project
//! directories.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;

use super::Error;
use crate::fileset::{self, Fileset};
use crate::migration::{self, MigrateOptions};
use crate::packages;
use crate::part::Part;
use crate::plugin::{BuildContext, Plugin};
use crate::project::Project;
use crate::sources::SourceHandler;
use crate::step::Step;
use crate::util;

/// Files and directories a built-in handler contributed to the step's
/// state
#[derive(Debug, Default)]
pub struct StepContents {
    pub files: BTreeSet<PathBuf>,
    pub dirs: BTreeSet<PathBuf>,
}

pub struct StepHandler<'a> {
    pub part: &'a Part,
    pub project: &'a Project,
    pub plugin: &'a dyn Plugin,
    pub source: Option<&'a dyn SourceHandler>,
}

impl StepHandler<'_> {
    pub fn run_builtin(&self, step: Step) -> Result<StepContents, Error> {
        match step {
            Step::Pull => self.builtin_pull(),
            Step::Overlay => Ok(StepContents::default()),
            Step::Build => self.builtin_build(),
            Step::Stage => self.builtin_stage(),
            Step::Prime => self.builtin_prime(),
        }
    }

    fn builtin_pull(&self) -> Result<StepContents, Error> {
        if let Some(source) = self.source {
            source.pull()?;
        }
        Ok(StepContents::default())
    }

    fn builtin_build(&self) -> Result<StepContents, Error> {
        let paths = self.project.paths.part(&self.part.name);

        let parallel_build_count = if self.part.spec.disable_parallel {
            NonZeroUsize::new(1).expect("one is non-zero")
        } else {
            util::num_cpus()
        };

        let context = BuildContext {
            src_dir: paths.src_dir(),
            build_dir: paths.build_dir(),
            install_dir: paths.install_dir(),
            stage_dir: self.project.paths.stage_dir(),
            parallel_build_count,
        };
        let commands = self.plugin.build_commands(&context)?;

        let mut script = String::new();
        for command in commands {
            let _ = writeln!(&mut script, "{command}");
        }

        let script_path = self.write_script("build", &script)?;
        let status = Command::new("/bin/bash")
            .arg(&script_path)
            .current_dir(paths.build_dir())
            .status()?;

        if !status.success() {
            return Err(Error::PluginBuild {
                part_name: self.part.name.clone(),
            });
        }

        Ok(StepContents::default())
    }

    fn builtin_stage(&self) -> Result<StepContents, Error> {
        let paths = self.project.paths.part(&self.part.name);
        let install_dir = paths.install_dir();
        let stage_dir = self.project.paths.stage_dir();

        let stage_fileset = Fileset::new("stage", self.part.spec.stage_files.clone())?;
        let (files, dirs) = fileset::migratable_filesets(
            &stage_fileset,
            &install_dir,
            self.project.default_partition(),
            self.project.default_partition(),
        )?;

        // dependent builds must resolve staged pkg-config files against
        // the staging area
        let fixup = |path: &Path| -> std::io::Result<()> {
            if path.extension().is_some_and(|ext| ext == "pc")
                && !fs::symlink_metadata(path).is_ok_and(|meta| meta.is_symlink())
            {
                packages::fix_pkg_config(path, &stage_dir, &install_dir)?;
            }
            Ok(())
        };

        let (files, dirs) = migration::migrate_files(
            &files,
            &dirs,
            &install_dir,
            &stage_dir,
            &MigrateOptions {
                fixup: Some(&fixup),
                ..Default::default()
            },
        )?;

        Ok(StepContents { files, dirs })
    }

    fn builtin_prime(&self) -> Result<StepContents, Error> {
        let paths = self.project.paths.part(&self.part.name);

        let mut prime_fileset = Fileset::new("prime", self.part.spec.prime_files.clone())?;

        // without an explicit prime filter, prime what stage selected
        if prime_fileset.entries() == ["*".to_owned()] || prime_fileset.includes().is_empty() {
            let stage_fileset = Fileset::new("stage", self.part.spec.stage_files.clone())?;
            prime_fileset.combine(&stage_fileset)?;
        }

        let (files, dirs) = fileset::migratable_filesets(
            &prime_fileset,
            &paths.install_dir(),
            self.project.default_partition(),
            self.project.default_partition(),
        )?;

        let (files, dirs) = migration::migrate_files(
            &files,
            &dirs,
            &self.project.paths.stage_dir(),
            &self.project.paths.prime_dir(),
            &MigrateOptions::default(),
        )?;

        Ok(StepContents { files, dirs })
    }

    /// Run a user override script in `work_dir`
    pub fn run_scriptlet(&self, scriptlet: &str, scriptlet_name: &str, work_dir: &Path) -> Result<(), Error> {
        let script = format!("set -euo pipefail\n{scriptlet}\n");
        let script_path = self.write_script(scriptlet_name, &script)?;

        util::ensure_dir_exists(work_dir)?;

        let status = Command::new("/bin/bash")
            .arg(&script_path)
            .current_dir(work_dir)
            .status()?;

        if !status.success() {
            return Err(Error::ScriptletRun {
                part_name: self.part.name.clone(),
                scriptlet: scriptlet_name.to_owned(),
                exit_code: status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }

    fn write_script(&self, name: &str, body: &str) -> Result<PathBuf, Error> {
        let run_dir = self.project.paths.part(&self.part.name).run_dir();
        util::ensure_dir_exists(&run_dir)?;

        let path = run_dir.join(format!("{name}.sh"));
        let env = generate_step_environment(self.part, self.project);
        fs::write(&path, format!("#!/bin/bash\n{env}\nset -x\n{body}"))?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;

        Ok(path)
    }
}

/// Environment block exported to every scriptlet and generated build
/// script
pub fn generate_step_environment(part: &Part, project: &Project) -> String {
    let paths = project.paths.part(&part.name);

    let parallel_build_count = if part.spec.disable_parallel {
        1
    } else {
        util::num_cpus().get()
    };

    let mut env = String::new();
    let mut export = |key: &str, value: &str| {
        let _ = writeln!(&mut env, "export {key}=\"{value}\"");
    };

    export("MASON_PART_NAME", &part.name);
    export("MASON_PART_SRC", &paths.src_dir().display().to_string());
    export("MASON_PART_BUILD", &paths.build_dir().display().to_string());
    export("MASON_PART_INSTALL", &paths.install_dir().display().to_string());
    export("MASON_STAGE", &project.paths.stage_dir().display().to_string());
    export("MASON_PRIME", &project.paths.prime_dir().display().to_string());
    export("MASON_TARGET_ARCH", &project.options.arch);
    export("MASON_PARALLEL_BUILD_COUNT", &parallel_build_count.to_string());

    for (name, var) in &project.options.project_vars {
        export(&format!("MASON_VAR_{}", name.to_uppercase().replace('-', "_")), &var.value);
    }

    env
}
