//! Canonical on-disk layout.
//!
//! ```text
//! <base>/rawdata/<subject>/<session>/ephys/<run>/
//! <base>/derivatives/<subject>/<session>/<run-or-concat_run>/
//!     preprocessed/<step_num>-<step_name>/...
//!     preprocessed/preprocessing_info.yaml
//!     <sorter>/...
//!     <sorter>/sorting_info.yaml
//!     <sorter>/quality_metrics.csv
//! <base>/derivatives/<subject>/concat_sessions/concat_run/<sorter>/...
//! <base>/derivatives/<subject>/logs/
//! ```
//!
//! Path derivation is pure. Existence of a resolved sorter-output path is the
//! only signal used to decide re-run behaviour, so distinct units must never
//! share a path; reserved tags are rejected as session and run names to keep
//! that true.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Sorter;
use crate::error::ConfigurationError;

pub const RAWDATA_DIR: &str = "rawdata";
pub const DERIVATIVES_DIR: &str = "derivatives";
pub const EPHYS_DIR: &str = "ephys";
pub const LOGS_DIR: &str = "logs";
pub const PREPROCESSED_DIR: &str = "preprocessed";
pub const PREPROCESSING_MANIFEST: &str = "preprocessing_info.yaml";
pub const SORTING_MANIFEST: &str = "sorting_info.yaml";
pub const QUALITY_METRICS_FILE: &str = "quality_metrics.csv";

/// Run tag of a concatenated sorting unit.
pub const CONCAT_RUN_TAG: &str = "concat_run";
/// Session tag of the all-sessions sorting unit.
pub const CONCAT_SESSIONS_TAG: &str = "concat_sessions";

const RESERVED_SESSION_NAMES: [&str; 2] = [CONCAT_SESSIONS_TAG, LOGS_DIR];
const RESERVED_RUN_NAMES: [&str; 2] = [CONCAT_RUN_TAG, PREPROCESSED_DIR];

fn is_valid_component(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        }
        _ => false,
    }
}

fn validate_name(kind: &'static str, name: &str, reserved: &[&str]) -> Result<(), ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidName {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if !is_valid_component(name) {
        return Err(invalid(
            "must be a single path component of letters, digits, '.', '_' or '-'",
        ));
    }
    if reserved.contains(&name) {
        return Err(invalid("name is reserved"));
    }
    Ok(())
}

pub fn validate_subject_name(name: &str) -> Result<(), ConfigurationError> {
    validate_name("subject", name, &[])
}

pub fn validate_session_name(name: &str) -> Result<(), ConfigurationError> {
    validate_name("session", name, &RESERVED_SESSION_NAMES)
}

pub fn validate_run_name(name: &str) -> Result<(), ConfigurationError> {
    validate_name("run", name, &RESERVED_RUN_NAMES)
}

/// Which derivative directory a sorting unit owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum UnitScope {
    /// A single run.
    Run { session: String, run: String },
    /// All runs of one session, concatenated.
    Session { session: String },
    /// All runs of all sessions, concatenated.
    AllSessions,
}

impl UnitScope {
    /// Session directory name the unit lives under.
    pub fn session_dir(&self) -> &str {
        match self {
            Self::Run { session, .. } | Self::Session { session } => session,
            Self::AllSessions => CONCAT_SESSIONS_TAG,
        }
    }

    /// Run-level directory name of the unit.
    pub fn run_dir(&self) -> &str {
        match self {
            Self::Run { run, .. } => run,
            Self::Session { .. } | Self::AllSessions => CONCAT_RUN_TAG,
        }
    }

    pub fn is_concatenated(&self) -> bool {
        !matches!(self, Self::Run { .. })
    }
}

impl fmt::Display for UnitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_dir(), self.run_dir())
    }
}

/// Kinds of artifact [`PathResolver::resolve`] can locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// Raw acquisition directory of a run.
    Raw,
    /// `preprocessed/` directory of a run.
    Preprocessed,
    /// Sorter output directory.
    Sorting(Sorter),
    /// Quality-metric table beside the sorter output.
    QualityMetrics(Sorter),
}

/// Maps (subject, session, run, artifact) to canonical paths under a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    base: PathBuf,
    subject: String,
}

impl PathResolver {
    pub fn new(base: impl Into<PathBuf>, subject: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            subject: subject.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// General entry point.
    ///
    /// Raw and preprocessed artifacts exist per run only. For sorter outputs,
    /// `concatenated = false` needs both session and run; `concatenated = true`
    /// takes a session (per-session concatenation) or no session (all
    /// sessions) and never a run.
    pub fn resolve(
        &self,
        session: Option<&str>,
        run: Option<&str>,
        artifact: Artifact,
        concatenated: bool,
    ) -> Result<PathBuf, ConfigurationError> {
        match artifact {
            Artifact::Raw | Artifact::Preprocessed => {
                if concatenated {
                    return Err(ConfigurationError::AmbiguousConcatenation(
                        "raw and preprocessed data exist per run only; concatenation applies to sorting"
                            .to_string(),
                    ));
                }
                let (session, run) = require_run(session, run)?;
                validate_session_name(session)?;
                validate_run_name(run)?;
                Ok(match artifact {
                    Artifact::Raw => self.raw_run_dir(session, run),
                    _ => self.preprocessed_dir(session, run),
                })
            }
            Artifact::Sorting(sorter) | Artifact::QualityMetrics(sorter) => {
                let scope = scope_for(session, run, concatenated)?;
                Ok(match artifact {
                    Artifact::Sorting(_) => self.sorter_dir(&scope, sorter),
                    _ => self.quality_metrics_path(&scope, sorter),
                })
            }
        }
    }

    pub fn subject_rawdata_dir(&self) -> PathBuf {
        self.base.join(RAWDATA_DIR).join(&self.subject)
    }

    pub fn subject_derivatives_dir(&self) -> PathBuf {
        self.base.join(DERIVATIVES_DIR).join(&self.subject)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.subject_derivatives_dir().join(LOGS_DIR)
    }

    pub fn raw_session_dir(&self, session: &str) -> PathBuf {
        self.subject_rawdata_dir().join(session).join(EPHYS_DIR)
    }

    pub fn raw_run_dir(&self, session: &str, run: &str) -> PathBuf {
        self.raw_session_dir(session).join(run)
    }

    pub fn unit_dir(&self, scope: &UnitScope) -> PathBuf {
        self.subject_derivatives_dir()
            .join(scope.session_dir())
            .join(scope.run_dir())
    }

    pub fn run_dir(&self, session: &str, run: &str) -> PathBuf {
        self.unit_dir(&UnitScope::Run {
            session: session.to_string(),
            run: run.to_string(),
        })
    }

    pub fn preprocessed_dir(&self, session: &str, run: &str) -> PathBuf {
        self.run_dir(session, run).join(PREPROCESSED_DIR)
    }

    pub fn preprocessed_step_dir(&self, session: &str, run: &str, step_key: &str) -> PathBuf {
        self.preprocessed_dir(session, run).join(step_key)
    }

    pub fn preprocessing_manifest_path(&self, session: &str, run: &str) -> PathBuf {
        self.preprocessed_dir(session, run).join(PREPROCESSING_MANIFEST)
    }

    pub fn sorter_dir(&self, scope: &UnitScope, sorter: Sorter) -> PathBuf {
        self.unit_dir(scope).join(sorter.as_str())
    }

    pub fn sorting_manifest_path(&self, scope: &UnitScope, sorter: Sorter) -> PathBuf {
        self.sorter_dir(scope, sorter).join(SORTING_MANIFEST)
    }

    pub fn quality_metrics_path(&self, scope: &UnitScope, sorter: Sorter) -> PathBuf {
        self.sorter_dir(scope, sorter).join(QUALITY_METRICS_FILE)
    }
}

fn require_run<'a>(
    session: Option<&'a str>,
    run: Option<&'a str>,
) -> Result<(&'a str, &'a str), ConfigurationError> {
    match (session, run) {
        (Some(session), Some(run)) => Ok((session, run)),
        _ => Err(ConfigurationError::AmbiguousConcatenation(
            "a per-run path needs both a session and a run".to_string(),
        )),
    }
}

fn scope_for(
    session: Option<&str>,
    run: Option<&str>,
    concatenated: bool,
) -> Result<UnitScope, ConfigurationError> {
    if !concatenated {
        let (session, run) = require_run(session, run)?;
        validate_session_name(session)?;
        validate_run_name(run)?;
        return Ok(UnitScope::Run {
            session: session.to_string(),
            run: run.to_string(),
        });
    }

    if let Some(run) = run {
        return Err(ConfigurationError::AmbiguousConcatenation(format!(
            "concatenated output requested for single run '{run}'"
        )));
    }

    match session {
        Some(session) => {
            validate_session_name(session)?;
            Ok(UnitScope::Session {
                session: session.to_string(),
            })
        }
        None => Ok(UnitScope::AllSessions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngExt, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    fn resolver() -> PathResolver {
        PathResolver::new("/data", "S1")
    }

    #[test]
    fn test_raw_and_preprocessed_paths() {
        let r = resolver();
        assert_eq!(
            r.resolve(Some("ses-1"), Some("r1"), Artifact::Raw, false).unwrap(),
            PathBuf::from("/data/rawdata/S1/ses-1/ephys/r1")
        );
        assert_eq!(
            r.resolve(Some("ses-1"), Some("r1"), Artifact::Preprocessed, false).unwrap(),
            PathBuf::from("/data/derivatives/S1/ses-1/r1/preprocessed")
        );
        assert_eq!(
            r.preprocessing_manifest_path("ses-1", "r1"),
            PathBuf::from("/data/derivatives/S1/ses-1/r1/preprocessed/preprocessing_info.yaml")
        );
    }

    #[test]
    fn test_sorter_paths_per_scope() {
        let r = resolver();
        let ks = Sorter::Kilosort2_5;

        assert_eq!(
            r.resolve(Some("ses-1"), Some("r1"), Artifact::Sorting(ks), false).unwrap(),
            PathBuf::from("/data/derivatives/S1/ses-1/r1/kilosort2_5")
        );
        assert_eq!(
            r.resolve(Some("ses-1"), None, Artifact::Sorting(ks), true).unwrap(),
            PathBuf::from("/data/derivatives/S1/ses-1/concat_run/kilosort2_5")
        );
        assert_eq!(
            r.resolve(None, None, Artifact::Sorting(ks), true).unwrap(),
            PathBuf::from("/data/derivatives/S1/concat_sessions/concat_run/kilosort2_5")
        );
        assert_eq!(
            r.resolve(Some("ses-1"), None, Artifact::QualityMetrics(ks), true).unwrap(),
            PathBuf::from("/data/derivatives/S1/ses-1/concat_run/kilosort2_5/quality_metrics.csv")
        );
    }

    #[test]
    fn test_concatenated_with_run_is_ambiguous() {
        let err = resolver()
            .resolve(Some("ses-1"), Some("r1"), Artifact::Sorting(Sorter::Kilosort3), true)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::AmbiguousConcatenation(_)));
    }

    #[test]
    fn test_concatenated_preprocessed_is_rejected() {
        let err = resolver()
            .resolve(Some("ses-1"), None, Artifact::Preprocessed, true)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::AmbiguousConcatenation(_)));
    }

    #[test]
    fn test_per_run_without_run_is_rejected() {
        assert!(resolver()
            .resolve(Some("ses-1"), None, Artifact::Sorting(Sorter::Kilosort3), false)
            .is_err());
    }

    #[test]
    fn test_reserved_and_unsafe_names_rejected() {
        assert!(validate_run_name(CONCAT_RUN_TAG).is_err());
        assert!(validate_session_name(CONCAT_SESSIONS_TAG).is_err());
        assert!(validate_session_name(LOGS_DIR).is_err());
        assert!(validate_run_name("..").is_err());
        assert!(validate_run_name("a/b").is_err());
        assert!(validate_run_name("").is_err());
        assert!(validate_run_name("run-1_g0.imec0").is_ok());
    }

    #[test]
    fn test_scope_display() {
        let scope = UnitScope::Run {
            session: "ses-1".to_string(),
            run: "r1".to_string(),
        };
        assert_eq!(scope.to_string(), "ses-1/r1");
        assert_eq!(
            UnitScope::Session { session: "ses-1".to_string() }.to_string(),
            "ses-1/concat_run"
        );
        assert_eq!(UnitScope::AllSessions.to_string(), "concat_sessions/concat_run");
    }

    fn random_name(rng: &mut ChaCha8Rng, prefix: &str) -> String {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789_-.";
        let len = rng.random_range(0..6);
        let mut name = String::from(prefix);
        for _ in 0..len {
            name.push(ALPHABET[rng.random_range(0..ALPHABET.len())] as char);
        }
        name
    }

    #[test]
    fn test_sorter_paths_unique_across_random_trees() {
        let r = resolver();
        let sorter = Sorter::Mountainsort5;

        for seed in 0..64u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut sessions = HashSet::new();
            for _ in 0..rng.random_range(1..5) {
                sessions.insert(random_name(&mut rng, "s"));
            }

            let mut scopes = vec![UnitScope::AllSessions];
            for session in &sessions {
                scopes.push(UnitScope::Session { session: session.clone() });
                let mut runs = HashSet::new();
                for _ in 0..rng.random_range(1..5) {
                    runs.insert(random_name(&mut rng, "r"));
                }
                for run in runs {
                    scopes.push(UnitScope::Run {
                        session: session.clone(),
                        run,
                    });
                }
            }

            let mut paths = HashSet::new();
            for scope in &scopes {
                let (session, run, concatenated) = match scope {
                    UnitScope::Run { session, run } => (Some(session.as_str()), Some(run.as_str()), false),
                    UnitScope::Session { session } => (Some(session.as_str()), None, true),
                    UnitScope::AllSessions => (None, None, true),
                };
                let path = r
                    .resolve(session, run, Artifact::Sorting(sorter), concatenated)
                    .unwrap();
                assert!(paths.insert(path.clone()), "seed {seed}: duplicate path {}", path.display());
            }
        }
    }
}
