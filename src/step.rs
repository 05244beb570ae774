// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

/// A stage of the part lifecycle.
///
/// Every part is processed through the same fixed pipeline: sources are
/// retrieved in [`Step::Pull`], the base filesystem is modified in
/// [`Step::Overlay`], artefacts are produced in [`Step::Build`], pooled into
/// the shared staging area in [`Step::Stage`] and filtered into the final
/// payload in [`Step::Prime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Step {
    Pull,
    Overlay,
    Build,
    Stage,
    Prime,
}

impl Step {
    pub const ALL: &'static [Self] = &[Step::Pull, Step::Overlay, Step::Build, Step::Stage, Step::Prime];

    /// Steps that must happen before this step, in pipeline order
    pub fn previous_steps(&self) -> &'static [Self] {
        match self {
            Step::Pull => &[],
            Step::Overlay => &[Step::Pull],
            Step::Build => &[Step::Pull, Step::Overlay],
            Step::Stage => &[Step::Pull, Step::Overlay, Step::Build],
            Step::Prime => &[Step::Pull, Step::Overlay, Step::Build, Step::Stage],
        }
    }

    /// Steps that happen after this step, in pipeline order
    pub fn next_steps(&self) -> &'static [Self] {
        match self {
            Step::Pull => &[Step::Overlay, Step::Build, Step::Stage, Step::Prime],
            Step::Overlay => &[Step::Build, Step::Stage, Step::Prime],
            Step::Build => &[Step::Stage, Step::Prime],
            Step::Stage => &[Step::Prime],
            Step::Prime => &[],
        }
    }

    /// The step an `after` dependency must have reached before this
    /// step can run. Pull and overlay don't depend on other parts.
    pub fn dependency_prerequisite(&self) -> Option<Step> {
        match self {
            Step::Pull | Step::Overlay => None,
            Step::Build | Step::Stage => Some(Step::Stage),
            Step::Prime => Some(Step::Prime),
        }
    }

    /// Lowercase name, used for state file names and action verbs
    pub fn key(&self) -> &'static str {
        match self {
            Step::Pull => "pull",
            Step::Overlay => "overlay",
            Step::Build => "build",
            Step::Stage => "stage",
            Step::Prime => "prime",
        }
    }
}
