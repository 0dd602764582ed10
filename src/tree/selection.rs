//! User-facing session/run selections.
//!
//! A selection is written `SESSION=RUN,RUN,...` on the command line. `all`
//! and `only` are keywords that are expanded against the raw-data directory;
//! `only` additionally requires exactly one match.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub const ALL_KEYWORD: &str = "all";
pub const ONLY_KEYWORD: &str = "only";

/// Which entries of a directory level to take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    All,
    Only,
    Named(String),
}

impl Selector {
    fn parse(raw: &str) -> Self {
        match raw {
            ALL_KEYWORD => Self::All,
            ONLY_KEYWORD => Self::Only,
            name => Self::Named(name.to_string()),
        }
    }

    pub fn is_keyword(&self) -> bool {
        !matches!(self, Self::Named(_))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(ALL_KEYWORD),
            Self::Only => f.write_str(ONLY_KEYWORD),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Runs requested for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSelection {
    All,
    Only,
    Named(Vec<String>),
}

/// One session and its runs, in the order the user gave them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSelection {
    pub session: Selector,
    pub runs: RunSelection,
}

impl SessionSelection {
    pub fn named(session: impl Into<String>, runs: &[&str]) -> Self {
        Self {
            session: Selector::Named(session.into()),
            runs: RunSelection::Named(runs.iter().map(|r| r.to_string()).collect()),
        }
    }

    pub fn all() -> Self {
        Self {
            session: Selector::All,
            runs: RunSelection::All,
        }
    }
}

impl FromStr for SessionSelection {
    type Err = ConfigurationError;

    /// Parses `ses-1=r1,r2`, `ses-1=all`, `ses-1` (all runs) or `all`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session_raw, runs_raw) = match s.split_once('=') {
            Some((session, runs)) => (session.trim(), Some(runs.trim())),
            None => (s.trim(), None),
        };
        if session_raw.is_empty() {
            return Err(ConfigurationError::InvalidSelection(format!(
                "'{s}' names no session"
            )));
        }

        let runs = match runs_raw {
            None | Some(ALL_KEYWORD) => RunSelection::All,
            Some(ONLY_KEYWORD) => RunSelection::Only,
            Some(list) => {
                let names: Vec<String> = list
                    .split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect();
                if names.is_empty() {
                    return Err(ConfigurationError::EmptySelection(format!(
                        "session '{session_raw}' lists no runs"
                    )));
                }
                if names.len() > 1
                    && names
                        .iter()
                        .any(|n| n == ALL_KEYWORD || n == ONLY_KEYWORD)
                {
                    return Err(ConfigurationError::InvalidSelection(format!(
                        "'{ALL_KEYWORD}' and '{ONLY_KEYWORD}' must be the only run entry for session '{session_raw}'"
                    )));
                }
                RunSelection::Named(names)
            }
        };

        Ok(Self {
            session: Selector::parse(session_raw),
            runs,
        })
    }
}

/// Checks keyword placement across a whole subject selection.
pub fn validate_selections(selections: &[SessionSelection]) -> Result<(), ConfigurationError> {
    if selections.is_empty() {
        return Err(ConfigurationError::EmptySelection(
            "no sessions were selected".to_string(),
        ));
    }
    let keyword_sessions = selections.iter().filter(|s| s.session.is_keyword()).count();
    if keyword_sessions > 0 && selections.len() > 1 {
        return Err(ConfigurationError::InvalidSelection(format!(
            "'{ALL_KEYWORD}' and '{ONLY_KEYWORD}' must be the only session entry"
        )));
    }
    if keyword_sessions == 1 && matches!(selections[0].runs, RunSelection::Named(_)) {
        return Err(ConfigurationError::InvalidSelection(
            "named runs cannot be combined with a session keyword".to_string(),
        ));
    }
    Ok(())
}
