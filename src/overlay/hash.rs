// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Content-addressed identification of overlay layers.
//!
//! Each part's layer is identified by a digest folded over the ordered
//! part list: the hash of layer *k* feeds into layer *k+1*, so a change
//! anywhere below the top invalidates every layer above it. The digest
//! of the last part identifies the whole stack.

use std::collections::HashMap;
use std::{fmt, io};

use fs_err as fs;
use sha1::{Digest, Sha1};

use crate::part::Part;
use crate::project::Project;

/// 20-byte digest identifying an overlay stack prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerHash([u8; 20]);

impl LayerHash {
    /// Seed used when no base layer is supplied
    pub const ZERO: Self = Self([0; 20]);

    /// Digest of a part's layer given the hash of the layer below it.
    /// Only the parameters that affect overlay contents participate.
    pub fn for_part(part: &Part, previous: &LayerHash) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(previous.0);

        for package in &part.spec.overlay_packages {
            hasher.update(b"overlay-package\0");
            hasher.update(package.as_bytes());
            hasher.update(b"\0");
        }

        if let Some(script) = &part.spec.overlay_script {
            hasher.update(b"overlay-script\0");
            hasher.update(script.as_bytes());
            hasher.update(b"\0");
        }

        for entry in &part.spec.overlay_files {
            hasher.update(b"overlay-file\0");
            hasher.update(entry.as_bytes());
            hasher.update(b"\0");
        }

        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_hex(hex_digest: &str) -> Option<Self> {
        let bytes = hex::decode(hex_digest.trim()).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }

    pub fn load(path: &std::path::Path) -> io::Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::from_hex(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{self}\n"))
    }
}

impl fmt::Display for LayerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        hex::encode(self.0).fmt(f)
    }
}

/// In-memory record of each part's layer hash as currently applied.
///
/// Initialized from the per-part `layer_hash` files; updated by the
/// sequencer as it schedules overlay work.
#[derive(Debug)]
pub struct LayerState {
    base: LayerHash,
    hashes: HashMap<String, LayerHash>,
}

impl LayerState {
    pub fn load(project: &Project) -> io::Result<Self> {
        let mut hashes = HashMap::new();

        for part in project.parts() {
            if let Some(hash) = LayerHash::load(&project.paths.part(&part.name).layer_hash_file())? {
                hashes.insert(part.name.clone(), hash);
            }
        }

        Ok(Self {
            base: project.base_layer_hash.unwrap_or(LayerHash::ZERO),
            hashes,
        })
    }

    /// The layer hash recorded for a part, if its overlay has been
    /// applied
    pub fn layer_hash(&self, part_name: &str) -> Option<LayerHash> {
        self.hashes.get(part_name).copied()
    }

    pub fn set_layer_hash(&mut self, part_name: &str, hash: LayerHash) {
        self.hashes.insert(part_name.to_owned(), hash);
    }

    /// Fold the stack up to and including `part`, from the current
    /// specification
    pub fn compute_layer_hash(&self, project: &Project, part: &Part) -> LayerHash {
        fold_layer_hash(project, Some(&part.name), self.base)
    }

    /// The recorded hash of the topmost layer; identifies the overlay
    /// state a build or stage observed
    pub fn overlay_hash(&self, project: &Project) -> Option<LayerHash> {
        let last = project.parts().last()?;
        self.layer_hash(&last.name)
    }
}

/// Left fold of [`LayerHash::for_part`] over the part list, stopping
/// after `up_to` when given
pub fn fold_layer_hash(project: &Project, up_to: Option<&str>, base: LayerHash) -> LayerHash {
    let mut hash = base;

    for part in project.parts() {
        hash = LayerHash::for_part(part, &hash);
        if up_to == Some(part.name.as_str()) {
            break;
        }
    }

    hash
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::part::PartSpec;
    use crate::paths::Paths;
    use crate::project::ProjectOptions;

    fn project(parts: Vec<Part>) -> Project {
        Project::new(parts, ProjectOptions::default(), Paths::new("/work")).unwrap()
    }

    fn overlay_part(name: &str, packages: &[&str]) -> Part {
        Part::new(
            name,
            PartSpec {
                overlay_packages: packages.iter().map(|s| (*s).to_owned()).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn hash_depends_only_on_overlay_parameters() {
        let plain = overlay_part("p", &["pkg"]);
        let mut modified = plain.clone();
        modified.spec.build_packages = vec!["gcc".to_owned()];
        modified.spec.stage_files = vec!["usr".to_owned()];

        assert_eq!(
            LayerHash::for_part(&plain, &LayerHash::ZERO),
            LayerHash::for_part(&modified, &LayerHash::ZERO)
        );

        let mut changed = plain.clone();
        changed.spec.overlay_packages = vec!["other".to_owned()];
        assert_ne!(
            LayerHash::for_part(&plain, &LayerHash::ZERO),
            LayerHash::for_part(&changed, &LayerHash::ZERO)
        );
    }

    #[test]
    fn lower_layer_change_invalidates_upper() {
        let lower_a = overlay_part("a", &["one"]);
        let lower_b = overlay_part("a", &["two"]);
        let upper = overlay_part("b", &["top"]);

        let stack_a = LayerHash::for_part(&upper, &LayerHash::for_part(&lower_a, &LayerHash::ZERO));
        let stack_b = LayerHash::for_part(&upper, &LayerHash::for_part(&lower_b, &LayerHash::ZERO));

        assert_ne!(stack_a, stack_b);
    }

    #[test]
    fn fold_stops_at_requested_part() {
        let project = project(vec![overlay_part("a", &["one"]), overlay_part("b", &["two"])]);

        let a_only = fold_layer_hash(&project, Some("a"), LayerHash::ZERO);
        let full = fold_layer_hash(&project, None, LayerHash::ZERO);

        let a = crate::part::part_by_name("a", project.parts()).unwrap();
        let b = crate::part::part_by_name("b", project.parts()).unwrap();
        assert_eq!(a_only, LayerHash::for_part(a, &LayerHash::ZERO));
        assert_eq!(full, LayerHash::for_part(b, &a_only));
    }

    #[test]
    fn hex_round_trip() {
        let part = overlay_part("p", &["pkg"]);
        let hash = LayerHash::for_part(&part, &LayerHash::ZERO);

        let parsed = LayerHash::from_hex(&hash.to_string()).unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_string().len(), 40);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/layer_hash");

        assert_eq!(LayerHash::load(&path).unwrap(), None);

        let part = overlay_part("p", &["pkg"]);
        let hash = LayerHash::for_part(&part, &LayerHash::ZERO);
        hash.save(&path).unwrap();

        assert_eq!(LayerHash::load(&path).unwrap(), Some(hash));
    }
}
