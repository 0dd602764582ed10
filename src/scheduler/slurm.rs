//! Slurm batch scheduler.
//!
//! Jobs are submitted as generated `sbatch` scripts and monitored through
//! `sacct`. Everything for one submission lives in its log directory:
//!
//! ```text
//! <log_dir>/descriptor.json
//! <log_dir>/job.sh
//! <log_dir>/slurm-<job_id>.out
//! <log_dir>/slurm-<job_id>.err
//! ```

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::job::{JobHandle, JobState, JobStatus};
use super::{BatchScheduler, BatchSubmission};
use crate::engine::process::{probe, run_tool};
use crate::error::{ConfigurationError, SchedulerError};

const SCHEDULER_NAME: &str = "slurm";
const JOB_SCRIPT: &str = "job.sh";

/// Resources requested for a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmOptions {
    pub nodes: u32,
    pub mem_gb: u32,
    pub timeout_min: u32,
    pub cpus_per_task: u32,
    pub tasks_per_node: u32,
    pub gres: Option<String>,
    pub partition: Option<String>,
    /// Comma-separated node names to avoid.
    pub exclude: Option<String>,
    /// Shell lines run before the worker starts (module loads, env activation).
    pub env_setup: Vec<String>,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            nodes: 1,
            mem_gb: 40,
            timeout_min: 24 * 60,
            cpus_per_task: 8,
            tasks_per_node: 1,
            gres: Some("gpu:1".to_string()),
            partition: Some("gpu".to_string()),
            exclude: None,
            env_setup: Vec::new(),
        }
    }
}

impl SlurmOptions {
    /// Applies a `key=value` override.
    ///
    /// Unknown keys are rejected rather than ignored.
    pub fn apply_override(&mut self, raw: &str) -> Result<(), ConfigurationError> {
        let (key, value) = raw.split_once('=').ok_or_else(|| ConfigurationError::InvalidValue {
            key: raw.to_string(),
            message: "expected key=value".to_string(),
        })?;
        let (key, value) = (key.trim(), value.trim());

        let number = |value: &str| {
            value.parse::<u32>().map_err(|_| ConfigurationError::InvalidValue {
                key: key.to_string(),
                message: format!("'{value}' is not a positive integer"),
            })
        };
        let optional = |value: &str| (!value.is_empty()).then(|| value.to_string());

        match key {
            "nodes" => self.nodes = number(value)?,
            "mem_gb" => self.mem_gb = number(value)?,
            "timeout_min" => self.timeout_min = number(value)?,
            "cpus_per_task" => self.cpus_per_task = number(value)?,
            "tasks_per_node" => self.tasks_per_node = number(value)?,
            "gres" => self.gres = optional(value),
            "partition" => self.partition = optional(value),
            "exclude" => self.exclude = optional(value),
            "env_setup" => self.env_setup.push(value.to_string()),
            other => {
                return Err(ConfigurationError::InvalidValue {
                    key: other.to_string(),
                    message: "unknown slurm option (expected one of nodes, mem_gb, timeout_min, \
                              cpus_per_task, tasks_per_node, gres, partition, exclude, env_setup)"
                        .to_string(),
                })
            }
        }
        Ok(())
    }

    fn time_limit(&self) -> String {
        format!("{:02}:{:02}:00", self.timeout_min / 60, self.timeout_min % 60)
    }
}

/// Renders the `sbatch` script for `submission`.
pub fn render_script(submission: &BatchSubmission) -> String {
    let options = &submission.options;
    let log_dir = submission.log_dir.display();
    let mut script = String::from("#!/bin/bash\n");

    let mut directive = |line: String| {
        let _ = writeln!(script, "#SBATCH {line}");
    };
    directive(format!("--job-name={}", submission.job_name));
    directive(format!("--nodes={}", options.nodes));
    directive(format!("--ntasks-per-node={}", options.tasks_per_node));
    directive(format!("--cpus-per-task={}", options.cpus_per_task));
    directive(format!("--mem={}G", options.mem_gb));
    directive(format!("--time={}", options.time_limit()));
    if let Some(partition) = &options.partition {
        directive(format!("--partition={partition}"));
    }
    if let Some(gres) = &options.gres {
        directive(format!("--gres={gres}"));
    }
    if let Some(exclude) = &options.exclude {
        directive(format!("--exclude={exclude}"));
    }
    directive(format!("--output={log_dir}/slurm-%j.out"));
    directive(format!("--error={log_dir}/slurm-%j.err"));

    script.push('\n');
    for line in &options.env_setup {
        script.push_str(line);
        script.push('\n');
    }
    let command: Vec<String> = submission.worker_command.iter().map(|a| shell_quote(a)).collect();
    let _ = writeln!(script, "exec {}", command.join(" "));
    script
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | ','));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Maps an `sacct` state to a job state.
pub fn parse_sacct_state(output: &str) -> JobState {
    let state = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or("");

    match state {
        "" | "PENDING" | "REQUEUED" | "SUSPENDED" => JobState::Pending,
        "RUNNING" | "CONFIGURING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Finished(JobStatus::Completed),
        "TIMEOUT" | "DEADLINE" => JobState::Finished(JobStatus::Timeout),
        s if s.starts_with("CANCELLED") => JobState::Finished(JobStatus::Cancelled),
        _ => JobState::Finished(JobStatus::Failed),
    }
}

/// Slurm through its command-line tools.
#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler;

impl SlurmScheduler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
    fn name(&self) -> &str {
        SCHEDULER_NAME
    }

    async fn ensure_available(&self) -> Result<(), SchedulerError> {
        if probe("sinfo", &["-V"]).await {
            Ok(())
        } else {
            Err(SchedulerError::Unavailable {
                scheduler: SCHEDULER_NAME.to_string(),
                reason: "`sinfo -V` failed; Slurm does not appear to be installed on this host".to_string(),
            })
        }
    }

    async fn submit(&self, submission: &BatchSubmission) -> Result<JobHandle, SchedulerError> {
        let script_path = submission.log_dir.join(JOB_SCRIPT);
        write_script(&script_path, &render_script(submission))?;

        let mut command = Command::new("sbatch");
        command.arg("--parsable").arg(&script_path);
        let output = run_tool("sbatch", &submission.job_name, command)
            .await
            .map_err(|e| SchedulerError::SubmissionFailed(e.to_string()))?;

        // --parsable prints `<job_id>[;<cluster>]`
        let job_id = output
            .stdout
            .trim()
            .split(';')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SchedulerError::SubmissionFailed("sbatch printed no job id".to_string()))?
            .to_string();

        info!(job_id = %job_id, log_dir = %submission.log_dir.display(), "Submitted Slurm job");
        Ok(JobHandle {
            job_id,
            scheduler: SCHEDULER_NAME.to_string(),
            log_dir: submission.log_dir.clone(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobState, SchedulerError> {
        let mut command = Command::new("sacct");
        command.args(["-j", job.job_id.as_str(), "-n", "-X", "-o", "State"]);
        let output = run_tool("sacct", &job.job_id, command)
            .await
            .map_err(|e| SchedulerError::Poll {
                job_id: job.job_id.clone(),
                reason: e.to_string(),
            })?;

        let state = parse_sacct_state(&output.stdout);
        debug!(job_id = %job.job_id, ?state, "Polled Slurm job");
        Ok(state)
    }
}

fn write_script(path: &Path, script: &str) -> Result<(), SchedulerError> {
    fs::write(path, script)
        .map_err(|e| SchedulerError::SubmissionFailed(format!("cannot write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn submission() -> BatchSubmission {
        BatchSubmission {
            job_name: "spikeflow-S1".to_string(),
            log_dir: PathBuf::from("/data/derivatives/S1/logs/slurm_logs/2026-01-02_03-04-05"),
            options: SlurmOptions::default(),
            worker_command: vec![
                "/opt/bin/spikeflow".to_string(),
                "run-task".to_string(),
                "/data/derivatives/S1/logs/slurm_logs/2026-01-02_03-04-05/descriptor.json".to_string(),
            ],
        }
    }

    #[test]
    fn test_default_script() {
        let script = render_script(&submission());

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --nodes=1\n"));
        assert!(script.contains("#SBATCH --mem=40G\n"));
        assert!(script.contains("#SBATCH --time=24:00:00\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=8\n"));
        assert!(script.contains("#SBATCH --gres=gpu:1\n"));
        assert!(script.contains("#SBATCH --partition=gpu\n"));
        assert!(!script.contains("--exclude"));
        assert!(script.trim_end().ends_with("descriptor.json"));
        assert!(script.contains("exec /opt/bin/spikeflow run-task "));
    }

    #[test]
    fn test_overrides() {
        let mut options = SlurmOptions::default();
        options.apply_override("mem_gb=64").unwrap();
        options.apply_override("timeout_min=90").unwrap();
        options.apply_override("gres=").unwrap();
        options.apply_override("env_setup=module load cuda").unwrap();

        assert_eq!(options.mem_gb, 64);
        assert_eq!(options.time_limit(), "01:30:00");
        assert!(options.gres.is_none());
        assert_eq!(options.env_setup, ["module load cuda"]);

        assert!(options.apply_override("gpus_per_node_x=1").is_err());
        assert!(options.apply_override("mem_gb=lots").is_err());
        assert!(options.apply_override("nodes").is_err());
    }

    #[test]
    fn test_sacct_states() {
        assert_eq!(parse_sacct_state(""), JobState::Pending);
        assert_eq!(parse_sacct_state("   PENDING \n"), JobState::Pending);
        assert_eq!(parse_sacct_state("RUNNING"), JobState::Running);
        assert_eq!(parse_sacct_state("COMPLETED"), JobState::Finished(JobStatus::Completed));
        assert_eq!(parse_sacct_state("OUT_OF_MEMORY"), JobState::Finished(JobStatus::Failed));
        assert_eq!(parse_sacct_state("TIMEOUT"), JobState::Finished(JobStatus::Timeout));
        assert_eq!(
            parse_sacct_state("CANCELLED by 1000"),
            JobState::Finished(JobStatus::Cancelled)
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/a/b.json"), "/a/b.json");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
