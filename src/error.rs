//! Error types for spikeflow operations.
//!
//! Errors are grouped by how a caller should react to them:
//! - `ConfigurationError`: the request itself is wrong; fix it and re-invoke
//! - `ConsistencyError`: the derivative tree or an internal invariant is broken
//! - `ExternalToolError`: an external engine or container exited unsuccessfully
//! - `SchedulerError`: batch submission or monitoring failed
//!
//! `PipelineError` aggregates all of them for the orchestrator. None of them is
//! retried automatically.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::policy::ExistingOutputMode;

/// The request cannot be executed as given.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Unknown sorter '{name}' (supported: {supported})")]
    UnknownSorter { name: String, supported: String },

    #[error("Conflicting image sources: {0}")]
    ConflictingImageSources(String),

    #[error("Ambiguous concatenation request: {0}")]
    AmbiguousConcatenation(String),

    #[error("Output already exists at {} ({stage} stage, mode '{mode}'); choose another existing-output mode to proceed", .path.display())]
    OutputExists {
        path: PathBuf,
        stage: String,
        mode: ExistingOutputMode,
    },

    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Session '{0}' is listed more than once")]
    DuplicateSession(String),

    #[error("Run '{run}' is listed more than once in session '{session}'")]
    DuplicateRun { session: String, run: String },

    #[error("Empty selection: {0}")]
    EmptySelection(String),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Raw data for {unit} not found at {}", .path.display())]
    MissingRawData { unit: String, path: PathBuf },

    #[error("Preprocessed data for {unit} not found at {}; run preprocessing first", .path.display())]
    MissingPreprocessedData { unit: String, path: PathBuf },

    #[error("Processing config '{name}' not found at {}", .path.display())]
    ConfigNotFound { name: String, path: PathBuf },

    #[error("Invalid processing config '{name}': {reason}")]
    InvalidProcessingConfig { name: String, reason: String },

    #[error("Sorter '{sorter}' cannot run without a container image: {reason}")]
    ImageUnavailable { sorter: String, reason: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// The derivative tree contradicts an invariant the pipeline relies on.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("Step numbering broken for {unit}: last step is {last} but {count} artifacts are present")]
    StepNumbering {
        unit: String,
        last: usize,
        count: usize,
    },

    #[error("Duplicate step {number} for {unit} ('{existing}' and '{duplicate}')")]
    DuplicateStepKey {
        unit: String,
        number: usize,
        existing: String,
        duplicate: String,
    },

    #[error("Malformed step key '{key}' for {unit}")]
    MalformedStepKey { unit: String, key: String },

    #[error("No preprocessing artifacts for {unit}")]
    NoArtifacts { unit: String },

    #[error("Output at {} has no manifest '{manifest}'; it is incomplete, rerun with mode 'overwrite'", .path.display())]
    MissingManifest { path: PathBuf, manifest: String },

    #[error("Manifest {} is unreadable: {reason}", .path.display())]
    CorruptManifest { path: PathBuf, reason: String },

    #[error("Manifest {} references missing artifact {}", .manifest.display(), .artifact.display())]
    MissingArtifact { manifest: PathBuf, artifact: PathBuf },
}

/// An external engine, container or sorter failed for a specific unit.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("{tool} failed for {unit}: {status}{}", detail_suffix(.detail))]
    Failed {
        tool: String,
        unit: String,
        status: String,
        detail: String,
    },

    #[error("Could not launch {tool} for {unit}: {source}")]
    Launch {
        tool: String,
        unit: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} produced unusable output for {unit}: {reason}")]
    InvalidOutput {
        tool: String,
        unit: String,
        reason: String,
    },
}

impl ExternalToolError {
    /// The unit (e.g. `ses-1/r1` or `ses-1/concat_run`) the failure belongs to.
    pub fn unit(&self) -> &str {
        match self {
            Self::Failed { unit, .. } | Self::Launch { unit, .. } | Self::InvalidOutput { unit, .. } => {
                unit
            }
        }
    }
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!("\n{detail}")
    }
}

/// Batch scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Batch scheduler '{scheduler}' is unavailable: {reason}")]
    Unavailable { scheduler: String, reason: String },

    #[error("Task is already running inside a batch job and requested batch submission again")]
    RecursiveSubmission,

    #[error("Job submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Could not query job {job_id}: {reason}")]
    Poll { job_id: String, reason: String },

    #[error("Job {job_id} finished with status {status}; see logs in {}", .log_dir.display())]
    JobFailed {
        job_id: String,
        status: String,
        log_dir: PathBuf,
    },
}

/// Top-level error for a pipeline invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Wraps an IO error with the path it happened at.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_exists_message_names_path_and_mode() {
        let err = ConfigurationError::OutputExists {
            path: PathBuf::from("/data/derivatives/S1/ses-1/r1/kilosort2_5"),
            stage: "sort".to_string(),
            mode: ExistingOutputMode::FailIfExists,
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/derivatives/S1/ses-1/r1/kilosort2_5"));
        assert!(msg.contains("fail_if_exists"));
        assert!(msg.contains("sort"));
    }

    #[test]
    fn test_external_tool_error_carries_unit() {
        let err = ExternalToolError::Failed {
            tool: "kilosort2_5".to_string(),
            unit: "ses-1/concat_run".to_string(),
            status: "exit code 1".to_string(),
            detail: String::new(),
        };
        assert_eq!(err.unit(), "ses-1/concat_run");
        assert_eq!(err.to_string(), "kilosort2_5 failed for ses-1/concat_run: exit code 1");

        let pipeline: PipelineError = err.into();
        assert!(matches!(pipeline, PipelineError::ExternalTool(_)));
    }

    #[test]
    fn test_io_error_includes_path() {
        let err = PipelineError::io(
            "/tmp/missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/missing"));
    }
}
