//! CLI command definitions for spikeflow.
//!
//! Every pipeline subcommand builds a [`PipelineRequest`] and hands it to the
//! [`JobDispatcher`], which runs it here or submits it to Slurm.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use tracing::{info, warn};

use crate::config::{parse_overrides, IsolationOptions, PipelineConfig, Sorter, DEFAULT_CONFIG_NAME};
use crate::engine::process::probe;
use crate::error::ConfigurationError;
use crate::execution::DockerClient;
use crate::layout::{validate_subject_name, PathResolver};
use crate::logging;
use crate::pipeline::{
    BatchOptions, IntermediateFile, PipelineOrchestrator, PipelineRequest, PipelineStage,
};
use crate::policy::ExistingOutputMode;
use crate::scheduler::{
    DispatchHandle, DispatchMode, JobDispatcher, SlurmOptions, SlurmScheduler, TaskDescriptor,
};
use crate::tree::SessionSelection;

/// Spike-sorting pipeline orchestrator.
#[derive(Parser)]
#[command(name = "spikeflow")]
#[command(about = "Preprocess, concatenate, spike-sort and quality-check electrophysiology runs")]
#[command(version)]
#[command(
    long_about = "spikeflow runs the preprocess -> concatenate -> sort -> quality-check pipeline over a\nrawdata/derivatives project tree, locally or as a Slurm batch job.\n\nExample usage:\n  spikeflow run --base-path /data/project --subject sub-001 --session ses-001=run-1,run-2 --concat-runs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the full pipeline: preprocess, sort and quality-check.
    Run(PipelineArgs),

    /// Preprocess runs only.
    Preprocess(PipelineArgs),

    /// Sort and quality-check runs that are already preprocessed.
    Sort(PipelineArgs),

    /// Execute a task descriptor written by a batch submission.
    #[command(name = "run-task", hide = true)]
    RunTask(RunTaskArgs),

    /// Report which container runtimes, schedulers and GPUs are available.
    #[command(name = "check-env")]
    CheckEnv,
}

/// Arguments shared by `run`, `preprocess` and `sort`.
#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    /// Project root holding `rawdata/` and `derivatives/`.
    #[arg(short = 'b', long)]
    pub base_path: PathBuf,

    /// Subject directory name.
    #[arg(short = 's', long)]
    pub subject: String,

    /// Session and runs, e.g. `ses-001=run-1,run-2`, `ses-001=all` or `all`.
    /// Repeatable; order is kept.
    #[arg(long = "session", required = true)]
    pub sessions: Vec<SessionSelection>,

    /// Processing config name or path to a YAML file.
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_NAME)]
    pub config: String,

    /// Sorter to run.
    #[arg(long, default_value = "kilosort2_5")]
    pub sorter: Sorter,

    /// Sorter option override as key=value (repeatable).
    #[arg(long = "sorter-option")]
    pub sorter_options: Vec<String>,

    #[arg(long, value_enum, default_value_t = ExistingOutputMode::FailIfExists)]
    pub existing_preprocessed: ExistingOutputMode,

    #[arg(long, value_enum, default_value_t = ExistingOutputMode::FailIfExists)]
    pub existing_sorting: ExistingOutputMode,

    #[arg(long, value_enum, default_value_t = ExistingOutputMode::LoadIfExists)]
    pub existing_quality: ExistingOutputMode,

    /// Sort all runs of a session as one recording.
    #[arg(long)]
    pub concat_runs: bool,

    /// Sort all sessions as one recording.
    #[arg(long)]
    pub concat_sessions: bool,

    /// Run the sorter in Singularity.
    #[arg(long, conflicts_with = "docker")]
    pub singularity: bool,

    /// Run the sorter in this Singularity image.
    #[arg(long, conflicts_with = "docker")]
    pub singularity_image: Option<PathBuf>,

    /// Run the sorter in Docker.
    #[arg(long)]
    pub docker: bool,

    /// Sorter byproduct to delete once quality checks are done (repeatable).
    #[arg(long, value_enum)]
    pub delete_intermediate: Vec<IntermediateFile>,

    /// Submit to Slurm instead of running here.
    #[arg(long)]
    pub batch: bool,

    /// Block until the batch job finishes.
    #[arg(long, requires = "batch")]
    pub wait: bool,

    /// Slurm option override as key=value (repeatable).
    #[arg(long = "slurm-option", requires = "batch")]
    pub slurm_options: Vec<String>,

    /// Print the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl PipelineArgs {
    pub fn to_request(&self) -> Result<PipelineRequest, ConfigurationError> {
        let mut request = PipelineRequest::new(
            &self.base_path,
            &self.subject,
            self.sessions.clone(),
            self.sorter,
        )
        .with_config_name(&self.config)
        .with_sorter_options(parse_overrides(&self.sorter_options)?)
        .with_existing_preprocessed(self.existing_preprocessed)
        .with_existing_sorting(self.existing_sorting)
        .with_existing_quality(self.existing_quality)
        .with_concat_runs(self.concat_runs)
        .with_concat_sessions(self.concat_sessions)
        .with_isolation(IsolationOptions {
            singularity: self.singularity,
            singularity_image: self.singularity_image.clone(),
            docker: self.docker,
        })
        .with_delete_intermediate(self.delete_intermediate.clone());

        if self.batch {
            let mut slurm = SlurmOptions::default();
            for raw in &self.slurm_options {
                slurm.apply_override(raw)?;
            }
            request = request.with_batch(BatchOptions {
                wait: self.wait,
                slurm,
            });
        }
        Ok(request)
    }
}

/// Arguments for `spikeflow run-task`.
#[derive(Parser, Debug)]
pub struct RunTaskArgs {
    /// Path to the task descriptor JSON.
    pub descriptor: PathBuf,

    /// Print the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl Cli {
    /// Per-invocation log file under the subject's logs directory.
    ///
    /// `None` for commands that touch no subject, or when the subject
    /// cannot be resolved yet.
    pub fn log_file(&self) -> Option<PathBuf> {
        let (resolver, command) = match &self.command {
            Commands::Run(args) => (args_resolver(args)?, "run"),
            Commands::Preprocess(args) => (args_resolver(args)?, "preprocess"),
            Commands::Sort(args) => (args_resolver(args)?, "sort"),
            Commands::RunTask(args) => {
                let task = TaskDescriptor::read_from(&args.descriptor).ok()?;
                validate_subject_name(&task.request.subject).ok()?;
                (task.request.resolver(), "run-task")
            }
            Commands::CheckEnv => return None,
        };
        let stamp = Local::now().format("%Y-%m-%d_%H%M%S");
        Some(resolver.logs_dir().join(format!("{stamp}_{command}.log")))
    }
}

fn args_resolver(args: &PipelineArgs) -> Option<PathResolver> {
    validate_subject_name(&args.subject).ok()?;
    Some(PathResolver::new(&args.base_path, &args.subject))
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args, PipelineStage::Full).await,
        Commands::Preprocess(args) => {
            run_pipeline_command(args, PipelineStage::PreprocessOnly).await
        }
        Commands::Sort(args) => run_pipeline_command(args, PipelineStage::SortOnly).await,
        Commands::RunTask(args) => run_task_command(args).await,
        Commands::CheckEnv => run_check_env_command().await,
    }
}

// ============================================================================
// Pipeline Commands
// ============================================================================

async fn run_pipeline_command(args: PipelineArgs, stage: PipelineStage) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    config.validate()?;

    let request = args.to_request()?;
    let (mode, wait) = match &request.batch {
        Some(batch) => (DispatchMode::Batch, batch.wait),
        None => (DispatchMode::Inline, false),
    };
    let task = TaskDescriptor::new(stage, request);
    info!(task = %task.id, %stage, subject = %task.request.subject, "Starting pipeline");

    let dispatcher = build_dispatcher(&config)?;
    let orchestrator = PipelineOrchestrator::from_config(config);
    orchestrator.preflight(&task.request, stage)?;
    logging::open_log_file();

    let handle = dispatcher.dispatch(&orchestrator, &task, mode, wait).await?;
    print_outcome(&handle, args.json)
}

async fn run_task_command(args: RunTaskArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    config.validate()?;

    let task = TaskDescriptor::read_from(&args.descriptor)?;
    info!(
        task = %task.id,
        stage = %task.stage,
        descriptor = %args.descriptor.display(),
        "Running batch task"
    );

    let dispatcher = build_dispatcher(&config)?;
    let orchestrator = PipelineOrchestrator::from_config(config);
    orchestrator.preflight(&task.request, task.stage)?;
    logging::open_log_file();

    let handle = dispatcher
        .dispatch(&orchestrator, &task, DispatchMode::Inline, false)
        .await?;
    print_outcome(&handle, args.json)
}

fn build_dispatcher(config: &PipelineConfig) -> anyhow::Result<JobDispatcher> {
    let worker = match &config.worker_executable {
        Some(exe) => exe.clone(),
        None => std::env::current_exe().context("Failed to locate the spikeflow executable")?,
    };
    Ok(JobDispatcher::new(Arc::new(SlurmScheduler::new()), worker)
        .with_poll_interval(config.poll_interval))
}

fn print_outcome(handle: &DispatchHandle, json: bool) -> anyhow::Result<()> {
    match handle {
        DispatchHandle::Inline(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(report)?);
            } else {
                print!("{report}");
                println!(
                    "{} stage result(s), {} computed, {} run(s) excluded",
                    report.results.len(),
                    report.completed(),
                    report.excluded.len()
                );
            }
        }
        DispatchHandle::Submitted(job) => {
            println!(
                "Submitted {} job {} (logs: {})",
                job.scheduler,
                job.job_id,
                job.log_dir.display()
            );
        }
        DispatchHandle::Finished { job, status } => {
            println!(
                "{} job {} finished: {} (logs: {})",
                job.scheduler,
                job.job_id,
                status,
                job.log_dir.display()
            );
        }
    }
    Ok(())
}

// ============================================================================
// Environment Check
// ============================================================================

async fn run_check_env_command() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;

    let docker = match DockerClient::new() {
        Ok(client) => client.ping().await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Docker client unavailable");
            false
        }
    };
    let checks = [
        ("docker", docker),
        ("singularity", probe("singularity", &["--version"]).await),
        ("slurm", probe("sinfo", &["-V"]).await),
        ("nvidia", probe("nvidia-smi", &[]).await),
    ];

    for (name, available) in checks {
        let label = if available { "available" } else { "not found" };
        println!("{name:<12} {label}");
    }
    println!("{:<12} {}", "images", config.local_images_dir.display());
    if let Some(hpc) = &config.hpc_images_dir {
        println!("{:<12} {}", "hpc images", hpc.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn pipeline_args(cli: Cli) -> PipelineArgs {
        match cli.command {
            Commands::Run(args) | Commands::Preprocess(args) | Commands::Sort(args) => args,
            _ => panic!("not a pipeline command"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let cli = parse(&[
            "spikeflow", "run", "-b", "/data", "-s", "sub-001", "--session", "ses-001=run-1,run-2",
        ]);
        let request = pipeline_args(cli).to_request().unwrap();

        assert_eq!(request.sorter, Sorter::Kilosort2_5);
        assert_eq!(request.config_name, "default");
        assert_eq!(request.existing_sorting, ExistingOutputMode::FailIfExists);
        assert_eq!(request.existing_quality, ExistingOutputMode::LoadIfExists);
        assert_eq!(
            request.sessions,
            vec![SessionSelection::named("ses-001", &["run-1", "run-2"])]
        );
        assert!(request.batch.is_none());
    }

    #[test]
    fn test_session_order_preserved() {
        let cli = parse(&[
            "spikeflow", "sort", "-b", "/d", "-s", "S", "--session", "ses-2=a", "--session",
            "ses-1=b",
        ]);
        let args = pipeline_args(cli);
        assert_eq!(
            args.sessions,
            vec![
                SessionSelection::named("ses-2", &["a"]),
                SessionSelection::named("ses-1", &["b"]),
            ]
        );
    }

    #[test]
    fn test_batch_options() {
        let cli = parse(&[
            "spikeflow", "run", "-b", "/d", "-s", "S", "--session", "all", "--batch", "--wait",
            "--slurm-option", "mem_gb=64", "--sorter", "mountainsort5",
            "--existing-preprocessed", "load_if_exists", "--delete-intermediate", "temp_wh.dat",
        ]);
        let request = pipeline_args(cli).to_request().unwrap();
        let batch = request.batch.unwrap();

        assert!(batch.wait);
        assert_eq!(batch.slurm.mem_gb, 64);
        assert_eq!(request.sorter, Sorter::Mountainsort5);
        assert_eq!(request.existing_preprocessed, ExistingOutputMode::LoadIfExists);
        assert_eq!(request.delete_intermediate, vec![IntermediateFile::TempWhDat]);
    }

    #[test]
    fn test_unknown_slurm_option_rejected() {
        let cli = parse(&[
            "spikeflow", "run", "-b", "/d", "-s", "S", "--session", "all", "--batch",
            "--slurm-option", "gpus=2",
        ]);
        assert!(pipeline_args(cli).to_request().is_err());
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        assert!(Cli::try_parse_from([
            "spikeflow", "run", "-b", "/d", "-s", "S", "--session", "all", "--docker",
            "--singularity",
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "spikeflow", "run", "-b", "/d", "-s", "S", "--session", "all", "--wait",
        ])
        .is_err());
    }

    #[tokio::test]
    async fn test_refused_run_creates_no_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("rawdata/S/ses-1/ephys/r1")).unwrap();
        let existing = dir.path().join("derivatives/S/ses-1/r1/preprocessed");
        std::fs::create_dir_all(&existing).unwrap();
        let base = dir.path().to_string_lossy().into_owned();

        let cli = parse(&["spikeflow", "preprocess", "-b", &base, "-s", "S", "--session", "ses-1=r1"]);
        let logs = cli.log_file().unwrap().parent().unwrap().to_path_buf();

        assert!(run_with_cli(cli).await.is_err());
        assert!(!logs.exists());
        assert_eq!(std::fs::read_dir(&existing).unwrap().count(), 0);
    }

    #[test]
    fn test_log_file_location() {
        let cli = parse(&["spikeflow", "preprocess", "-b", "/d", "-s", "S", "--session", "all"]);
        let path = cli.log_file().unwrap();

        assert!(path.starts_with("/d/derivatives/S/logs"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_preprocess.log"));

        assert!(parse(&["spikeflow", "check-env"]).log_file().is_none());
    }
}
