// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Source retrieval capability.
//!
//! The engine does not fetch anything itself; the caller supplies a
//! [`SourceProvider`] resolving each part's source declaration to a
//! handler for the git/http/tar/... mechanics.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::part::Part;
use crate::paths::Paths;

/// Retrieves and updates one part's source tree
pub trait SourceHandler {
    /// Fetch the source into the part's source directory
    fn pull(&self) -> Result<(), Error>;

    /// Refresh a previously pulled source in place
    fn update(&self) -> Result<(), Error>;

    /// Whether the on-disk source is newer than the given state file.
    /// Sources that cannot tell return [`Error::Unsupported`].
    fn check_if_outdated(&self, state_file: &Path) -> Result<bool, Error>;

    /// Provenance details recorded in the pull state assets
    fn source_details(&self) -> Option<BTreeMap<String, String>> {
        None
    }
}

/// Constructs source handlers per part. Parts without a source resolve
/// to `None`.
pub trait SourceProvider {
    fn source_handler(&self, part: &Part, paths: &Paths) -> Result<Option<Box<dyn SourceHandler>>, Error>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to pull source: {0}")]
    Pull(String),
    #[error("failed to update source: {0}")]
    Update(String),
    #[error("source does not support update checks")]
    Unsupported,
    #[error("unknown source type: {0}")]
    UnknownSourceType(String),
    #[error("io")]
    Io(#[from] std::io::Error),
}
