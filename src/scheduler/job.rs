//! Job definitions for batch dispatch.
//!
//! - `TaskDescriptor`: serializable description of a pipeline invocation
//! - `JobHandle`: a submitted batch job
//! - `JobStatus`: terminal status of a batch job

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::{PipelineRequest, PipelineStage};

/// Where a descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Built from the command line of this process.
    Local,
    /// Read by a batch worker from a submitted descriptor.
    BatchSubmission,
}

/// A pipeline invocation that can run in-process or on a batch worker.
///
/// The descriptor holds inputs only; all decisions are made from the
/// filesystem wherever it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub stage: PipelineStage,
    pub request: PipelineRequest,
    pub origin: TaskOrigin,
}

impl TaskDescriptor {
    pub fn new(stage: PipelineStage, request: PipelineRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            stage,
            request,
            origin: TaskOrigin::Local,
        }
    }

    /// The descriptor a batch worker executes: same inputs, inline dispatch.
    pub fn for_batch_worker(&self) -> Self {
        let mut worker = self.clone();
        worker.request.batch = None;
        worker.origin = TaskOrigin::BatchSubmission;
        worker
    }

    pub fn write_to(&self, path: &Path) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| PipelineError::io(path, e))
    }

    pub fn read_from(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// A job accepted by a batch scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub scheduler: String,
    /// Directory holding the descriptor, job script and job logs.
    pub log_dir: PathBuf,
}

/// Terminal status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job completed successfully.
    Completed,
    /// Job exited with an error or its node failed.
    Failed,
    /// Job hit its time limit.
    Timeout,
    /// Job was cancelled before completion.
    Cancelled,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        *self == JobStatus::Completed
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Scheduler-reported state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Finished(JobStatus),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Sorter;
    use crate::pipeline::BatchOptions;
    use crate::tree::SessionSelection;

    fn request() -> PipelineRequest {
        PipelineRequest::new(
            "/data",
            "S1",
            vec![SessionSelection::named("ses-1", &["r1", "r2"])],
            Sorter::Kilosort2_5,
        )
        .with_concat_runs(true)
        .with_batch(BatchOptions::default())
    }

    #[test]
    fn test_worker_descriptor_runs_inline() {
        let task = TaskDescriptor::new(PipelineStage::Full, request());
        let worker = task.for_batch_worker();

        assert_eq!(worker.id, task.id);
        assert_eq!(worker.origin, TaskOrigin::BatchSubmission);
        assert!(worker.request.batch.is_none());
        assert!(worker.request.concat_runs);
    }

    #[test]
    fn test_descriptor_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("descriptor.json");
        let task = TaskDescriptor::new(PipelineStage::SortOnly, request()).for_batch_worker();

        task.write_to(&path).unwrap();
        assert_eq!(TaskDescriptor::read_from(&path).unwrap(), task);
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(format!("{}", JobStatus::Completed), "completed");
        assert_eq!(format!("{}", JobStatus::Failed), "failed");
        assert_eq!(format!("{}", JobStatus::Timeout), "timeout");
        assert_eq!(format!("{}", JobStatus::Cancelled), "cancelled");
        assert!(JobStatus::Completed.is_success());
        assert!(!JobStatus::Timeout.is_success());
    }
}
