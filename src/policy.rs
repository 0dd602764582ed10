//! Existing-output resolution.
//!
//! Every stage target is checked against a user-selected mode before any work
//! is done. The filesystem is the only record of prior completion, so the
//! decision depends on nothing but "does the target path exist".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// What to do when a stage's output is already on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ExistingOutputMode {
    /// Abort the whole invocation.
    FailIfExists,
    /// Remove the entire prior output and recompute. Destructive.
    Overwrite,
    /// Reuse the prior output.
    LoadIfExists,
    /// Leave the prior output untouched and do not use it downstream.
    SkipIfExists,
}

impl ExistingOutputMode {
    /// All modes, in declaration order.
    pub const ALL: [ExistingOutputMode; 4] = [
        Self::FailIfExists,
        Self::Overwrite,
        Self::LoadIfExists,
        Self::SkipIfExists,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailIfExists => "fail_if_exists",
            Self::Overwrite => "overwrite",
            Self::LoadIfExists => "load_if_exists",
            Self::SkipIfExists => "skip_if_exists",
        }
    }
}

impl fmt::Display for ExistingOutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExistingOutputMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigurationError::InvalidValue {
                key: "existing output mode".to_string(),
                message: format!(
                    "'{s}' is not one of fail_if_exists, overwrite, load_if_exists, skip_if_exists"
                ),
            })
    }
}

/// Outcome of checking a target against an [`ExistingOutputMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAction {
    ProceedFresh,
    LoadExisting,
    Skip,
    Fail,
}

impl fmt::Display for OutputAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProceedFresh => write!(f, "proceed_fresh"),
            Self::LoadExisting => write!(f, "load_existing"),
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Decides what to do with a target given whether it exists.
pub fn decide(path_exists: bool, mode: ExistingOutputMode) -> OutputAction {
    if !path_exists {
        return OutputAction::ProceedFresh;
    }
    match mode {
        ExistingOutputMode::FailIfExists => OutputAction::Fail,
        ExistingOutputMode::Overwrite => OutputAction::ProceedFresh,
        ExistingOutputMode::LoadIfExists => OutputAction::LoadExisting,
        ExistingOutputMode::SkipIfExists => OutputAction::Skip,
    }
}

/// Whether proceeding must first remove the prior output.
///
/// Only `Overwrite` on an existing target is destructive.
pub fn requires_removal(path_exists: bool, mode: ExistingOutputMode) -> bool {
    path_exists && mode == ExistingOutputMode::Overwrite
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_truth_table() {
        use ExistingOutputMode::*;
        use OutputAction::*;

        let table = [
            (false, FailIfExists, ProceedFresh),
            (false, Overwrite, ProceedFresh),
            (false, LoadIfExists, ProceedFresh),
            (false, SkipIfExists, ProceedFresh),
            (true, FailIfExists, Fail),
            (true, Overwrite, ProceedFresh),
            (true, LoadIfExists, LoadExisting),
            (true, SkipIfExists, Skip),
        ];

        for (exists, mode, expected) in table {
            assert_eq!(decide(exists, mode), expected, "exists={exists} mode={mode}");
        }
    }

    #[test]
    fn test_requires_removal_only_for_existing_overwrite() {
        for mode in ExistingOutputMode::ALL {
            assert!(!requires_removal(false, mode));
            assert_eq!(
                requires_removal(true, mode),
                mode == ExistingOutputMode::Overwrite
            );
        }
    }

    #[test]
    fn test_mode_parse_and_display() {
        for mode in ExistingOutputMode::ALL {
            let parsed: ExistingOutputMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert!("use_existing".parse::<ExistingOutputMode>().is_err());
    }

    #[test]
    fn test_mode_serde_uses_snake_case() {
        let yaml = serde_yaml::to_string(&ExistingOutputMode::SkipIfExists).unwrap();
        assert_eq!(yaml.trim(), "skip_if_exists");
    }
}
