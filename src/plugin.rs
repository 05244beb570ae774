// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build plugin capability.
//!
//! A plugin turns a part's declaration into concrete build commands for
//! one build system (make, cmake, cargo, ...). The engine writes the
//! commands to a script and runs it; it never interprets them.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use thiserror::Error;

use crate::part::Part;

/// Directories and settings a plugin may reference when generating
/// build commands
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub src_dir: PathBuf,
    pub build_dir: PathBuf,
    pub install_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub parallel_build_count: NonZeroUsize,
}

/// Generates the build behavior for one part
pub trait Plugin {
    /// Shell commands realizing the build step
    fn build_commands(&self, context: &BuildContext) -> Result<Vec<String>, Error>;

    /// Packages the plugin needs on the host to build
    fn build_packages(&self) -> Vec<String> {
        vec![]
    }

    /// Snaps the plugin needs on the host to build
    fn build_snaps(&self) -> Vec<String> {
        vec![]
    }

    /// Whether the plugin builds outside the source tree. In-source
    /// builds get a copy of the source in the build directory.
    fn out_of_source_build(&self) -> bool {
        false
    }
}

/// Resolves a part's `plugin` declaration to an implementation
pub trait PluginProvider {
    fn plugin(&self, part: &Part) -> Result<Box<dyn Plugin>, Error>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("invalid plugin properties: {0}")]
    InvalidProperties(String),
}
