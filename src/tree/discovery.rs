//! Building a [`RunTree`] from selections and the raw-data directory.

use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ConfigurationError, PipelineError};
use crate::layout::PathResolver;
use crate::tree::selection::{validate_selections, RunSelection, Selector, SessionSelection};
use crate::tree::RunTree;

/// Prefix of session directories considered by keyword discovery.
const SESSION_PREFIX: &str = "ses-";

/// A directory entry with its acquisition timestamp.
#[derive(Debug, Clone)]
struct TimedEntry {
    name: String,
    acquired: SystemTime,
}

/// Expands selections against `<base>/rawdata/<subject>` into an ordered tree.
///
/// Keyword expansions are ordered by acquisition time: the directory's
/// creation time, or its modification time where the filesystem does not
/// record creation, with the name breaking ties. Explicit lists keep the
/// caller's order.
pub fn discover(resolver: &PathResolver, selections: &[SessionSelection]) -> Result<RunTree, PipelineError> {
    validate_selections(selections)?;

    let mut sessions: Vec<(String, Vec<String>)> = Vec::new();
    for selection in selections {
        let session_names = match &selection.session {
            Selector::Named(name) => vec![name.clone()],
            keyword => {
                let root = resolver.subject_rawdata_dir();
                let found: Vec<String> = list_by_acquisition(&root)?
                    .into_iter()
                    .filter(|name| name.starts_with(SESSION_PREFIX))
                    .collect();
                expect_matches(keyword, found, &root, resolver.subject())?
            }
        };

        for session in session_names {
            let runs = match &selection.runs {
                RunSelection::Named(runs) => {
                    warn_if_out_of_acquisition_order(resolver, &session, runs);
                    runs.clone()
                }
                keyword => {
                    let root = resolver.raw_session_dir(&session);
                    let selector = match keyword {
                        RunSelection::Only => Selector::Only,
                        _ => Selector::All,
                    };
                    expect_matches(&selector, list_by_acquisition(&root)?, &root, &session)?
                }
            };
            debug!(session = %session, runs = ?runs, "Selected runs");
            sessions.push((session, runs));
        }
    }

    Ok(RunTree::from_ordered(resolver.subject(), sessions)?)
}

fn list_session_runs(resolver: &PathResolver, session: &str) -> Result<Vec<String>, PipelineError> {
    list_by_acquisition(&resolver.raw_session_dir(session))
}

fn expect_matches(
    keyword: &Selector,
    found: Vec<String>,
    root: &Path,
    owner: &str,
) -> Result<Vec<String>, ConfigurationError> {
    if found.is_empty() {
        return Err(ConfigurationError::MissingRawData {
            unit: owner.to_string(),
            path: root.to_path_buf(),
        });
    }
    if *keyword == Selector::Only && found.len() != 1 {
        return Err(ConfigurationError::InvalidSelection(format!(
            "'only' was given for {owner} but {} entries exist in {}: {}",
            found.len(),
            root.display(),
            found.join(", ")
        )));
    }
    Ok(found)
}

/// Subdirectory names of `dir`, oldest acquisition first.
fn list_by_acquisition(dir: &Path) -> Result<Vec<String>, PipelineError> {
    if !dir.is_dir() {
        return Err(ConfigurationError::MissingRawData {
            unit: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: dir.to_path_buf(),
        }
        .into());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            PipelineError::io(&path, e.into())
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let metadata = entry
            .metadata()
            .map_err(|e| PipelineError::io(entry.path(), e.into()))?;
        let acquired = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(TimedEntry { name, acquired });
    }

    entries.sort_by(|a, b| a.acquired.cmp(&b.acquired).then_with(|| a.name.cmp(&b.name)));
    Ok(entries.into_iter().map(|e| e.name).collect())
}

fn warn_if_out_of_acquisition_order(resolver: &PathResolver, session: &str, runs: &[String]) {
    let Ok(by_time) = list_session_runs(resolver, session) else {
        return;
    };
    let expected: Vec<&String> = by_time.iter().filter(|r| runs.contains(r)).collect();
    if expected.len() == runs.len() && expected.iter().zip(runs).any(|(a, b)| *a != b) {
        warn!(
            session = %session,
            given = ?runs,
            acquisition_order = ?expected,
            "Runs are not listed in acquisition order; they will be concatenated in the order given"
        );
    }
}
