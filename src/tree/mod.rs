//! The session → run hierarchy of one subject.
//!
//! A `RunTree` is built once per invocation and never mutated. Iteration
//! order over sessions and runs is the order the tree was built with, which
//! is the concatenation order handed to the sorter.

pub mod discovery;
pub mod selection;
pub mod steps;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::layout::{validate_run_name, validate_session_name, validate_subject_name};

pub use discovery::discover;
pub use selection::{RunSelection, Selector, SessionSelection};
pub use steps::{ArtifactChain, StepArtifact};

/// Identity of a run within a subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub session: String,
    pub run: String,
}

impl RunKey {
    pub fn new(session: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            run: run.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.run)
    }
}

/// A session and its runs in acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    runs: Vec<String>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runs(&self) -> &[String] {
        &self.runs
    }

    pub fn run_keys(&self) -> impl Iterator<Item = RunKey> + '_ {
        self.runs.iter().map(move |run| RunKey::new(&self.id, run))
    }
}

/// Immutable, ordered model of a subject's sessions and runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTree {
    subject: String,
    sessions: Vec<Session>,
}

impl RunTree {
    /// Builds a tree from explicitly ordered `(session, runs)` pairs.
    ///
    /// # Errors
    ///
    /// Rejects empty trees, sessions without runs, invalid or reserved names,
    /// and duplicates of a session within the subject or a run within a session.
    pub fn from_ordered<S, R>(
        subject: impl Into<String>,
        sessions: impl IntoIterator<Item = (S, Vec<R>)>,
    ) -> Result<Self, ConfigurationError>
    where
        S: Into<String>,
        R: Into<String>,
    {
        let subject = subject.into();
        validate_subject_name(&subject)?;

        let mut seen_sessions = HashSet::new();
        let mut built = Vec::new();

        for (session, runs) in sessions {
            let id: String = session.into();
            validate_session_name(&id)?;
            if !seen_sessions.insert(id.clone()) {
                return Err(ConfigurationError::DuplicateSession(id));
            }

            let runs: Vec<String> = runs.into_iter().map(Into::into).collect();
            if runs.is_empty() {
                return Err(ConfigurationError::EmptySelection(format!(
                    "session '{id}' has no runs"
                )));
            }

            let mut seen_runs = HashSet::new();
            for run in &runs {
                validate_run_name(run)?;
                if !seen_runs.insert(run.as_str()) {
                    return Err(ConfigurationError::DuplicateRun {
                        session: id.clone(),
                        run: run.clone(),
                    });
                }
            }

            built.push(Session { id, runs });
        }

        if built.is_empty() {
            return Err(ConfigurationError::EmptySelection(format!(
                "subject '{subject}' has no sessions"
            )));
        }

        Ok(Self {
            subject,
            sessions: built,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// All runs, session by session, in tree order.
    pub fn runs(&self) -> impl Iterator<Item = RunKey> + '_ {
        self.sessions.iter().flat_map(Session::run_keys)
    }

    pub fn run_count(&self) -> usize {
        self.sessions.iter().map(|s| s.runs.len()).sum()
    }

    pub fn contains(&self, key: &RunKey) -> bool {
        self.session(&key.session)
            .is_some_and(|s| s.runs.iter().any(|r| *r == key.run))
    }
}
