//! Job dispatch: run a pipeline task in this process or on a batch scheduler.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │  TaskDescriptor  │
//!                  └────────┬─────────┘
//!                           │ dispatch(mode, wait)
//!              ┌────────────┴─────────────┐
//!        Inline│                          │Batch
//!              ▼                          ▼
//!     ┌─────────────────┐      ┌─────────────────────┐
//!     │   TaskRunner    │      │   BatchScheduler    │
//!     │ (orchestrator)  │      │ descriptor.json ──► │
//!     └─────────────────┘      │ `spikeflow run-task`│
//!                              └─────────────────────┘
//! ```
//!
//! Both paths end in the same `TaskRunner`; a batch worker reads the
//! descriptor and runs it inline. A descriptor that came from a batch
//! submission is never submitted again.

pub mod job;
pub mod slurm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tracing::{debug, info};

use crate::error::{PipelineError, SchedulerError};
use crate::pipeline::PipelineReport;

pub use job::{JobHandle, JobState, JobStatus, TaskDescriptor, TaskOrigin};
pub use slurm::{SlurmOptions, SlurmScheduler};

/// Directory under the subject's logs holding one folder per submission.
pub const SLURM_LOGS_DIR: &str = "slurm_logs";
pub const DESCRIPTOR_FILE: &str = "descriptor.json";

/// Where a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Inline,
    Batch,
}

/// Executes a task in the current process.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: &TaskDescriptor) -> Result<PipelineReport, PipelineError>;
}

/// Everything a scheduler needs to submit one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSubmission {
    pub job_name: String,
    pub log_dir: PathBuf,
    pub options: SlurmOptions,
    /// Command the job runs: the worker executable, `run-task`, the descriptor.
    pub worker_command: Vec<String>,
}

/// A cluster batch scheduler.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Fails when the scheduler cannot accept jobs from this host.
    async fn ensure_available(&self) -> Result<(), SchedulerError>;

    async fn submit(&self, submission: &BatchSubmission) -> Result<JobHandle, SchedulerError>;

    async fn poll(&self, job: &JobHandle) -> Result<JobState, SchedulerError>;
}

/// Result of a dispatch.
#[derive(Debug, Clone)]
pub enum DispatchHandle {
    /// The task ran in this process.
    Inline(PipelineReport),
    /// The job was submitted and not waited on.
    Submitted(JobHandle),
    /// The job was submitted and completed successfully.
    Finished { job: JobHandle, status: JobStatus },
}

/// Runs tasks inline or through a batch scheduler.
#[derive(Clone)]
pub struct JobDispatcher {
    scheduler: Arc<dyn BatchScheduler>,
    poll_interval: Duration,
    worker_executable: PathBuf,
}

impl JobDispatcher {
    pub fn new(scheduler: Arc<dyn BatchScheduler>, worker_executable: impl Into<PathBuf>) -> Self {
        Self {
            scheduler,
            poll_interval: Duration::from_secs(30),
            worker_executable: worker_executable.into(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Dispatches `task`.
    ///
    /// `Inline` runs `runner` now and propagates its errors. `Batch` checks
    /// the scheduler, writes the worker descriptor, submits, and blocks until
    /// the job is terminal only when `wait` is set.
    pub async fn dispatch(
        &self,
        runner: &dyn TaskRunner,
        task: &TaskDescriptor,
        mode: DispatchMode,
        wait: bool,
    ) -> Result<DispatchHandle, PipelineError> {
        match mode {
            DispatchMode::Inline => {
                debug!(task = %task.id, stage = %task.stage, "Running task inline");
                Ok(DispatchHandle::Inline(runner.run_task(task).await?))
            }
            DispatchMode::Batch => {
                let job = self.submit(task).await?;
                if !wait {
                    return Ok(DispatchHandle::Submitted(job));
                }
                let status = self.wait(&job).await?;
                if !status.is_success() {
                    return Err(SchedulerError::JobFailed {
                        job_id: job.job_id.clone(),
                        status: status.to_string(),
                        log_dir: job.log_dir.clone(),
                    }
                    .into());
                }
                Ok(DispatchHandle::Finished { job, status })
            }
        }
    }

    async fn submit(&self, task: &TaskDescriptor) -> Result<JobHandle, PipelineError> {
        if task.origin == TaskOrigin::BatchSubmission {
            return Err(SchedulerError::RecursiveSubmission.into());
        }
        self.scheduler.ensure_available().await?;

        let request = &task.request;
        let log_dir = request
            .resolver()
            .logs_dir()
            .join(SLURM_LOGS_DIR)
            .join(Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
        std::fs::create_dir_all(&log_dir).map_err(|e| PipelineError::io(&log_dir, e))?;

        let descriptor = log_dir.join(DESCRIPTOR_FILE);
        task.for_batch_worker().write_to(&descriptor)?;

        let submission = BatchSubmission {
            job_name: format!("spikeflow-{}-{}", request.subject, task.stage),
            log_dir: log_dir.clone(),
            options: request.batch.as_ref().map(|b| b.slurm.clone()).unwrap_or_default(),
            worker_command: vec![
                self.worker_executable.to_string_lossy().into_owned(),
                "run-task".to_string(),
                descriptor.to_string_lossy().into_owned(),
            ],
        };

        let job = self.scheduler.submit(&submission).await?;
        info!(
            scheduler = self.scheduler.name(),
            job_id = %job.job_id,
            logs = %log_dir.display(),
            "Task submitted"
        );
        Ok(job)
    }

    /// Polls until `job` reaches a terminal status.
    pub async fn wait(&self, job: &JobHandle) -> Result<JobStatus, SchedulerError> {
        loop {
            match self.scheduler.poll(job).await? {
                JobState::Finished(status) => {
                    info!(job_id = %job.job_id, %status, "Batch job finished");
                    return Ok(status);
                }
                state => {
                    debug!(job_id = %job.job_id, ?state, "Waiting for batch job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
