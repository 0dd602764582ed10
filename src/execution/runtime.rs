//! Sorter runtime: runs a sorter locally, under Singularity or in Docker.
//!
//! The working directory is always handed to the child process or container.
//! Nothing here changes the orchestrator's own current directory.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::docker_client::{ContainerConfig, DockerClient};
use crate::config::IsolationImage;
use crate::engine::process::{command_from, run_tool, tail};
use crate::engine::{SorterInvocation, SorterRuntime};
use crate::error::ExternalToolError;

const SINGULARITY: &str = "singularity";
const DOCKER_TOOL: &str = "docker";
const LOG_TAIL_LINES: usize = 20;

/// Runs the configured sorter command under the invocation's isolation image.
#[derive(Debug, Clone)]
pub struct IsolatedSorterRuntime {
    sorter_command: Vec<String>,
}

impl IsolatedSorterRuntime {
    pub fn new(sorter_command: Vec<String>) -> Self {
        Self { sorter_command }
    }

    /// Full sorter command line for `invocation`.
    pub fn sorter_args(&self, invocation: &SorterInvocation) -> Result<Vec<String>, ExternalToolError> {
        let options = serde_json::to_string(&invocation.options).map_err(|e| ExternalToolError::InvalidOutput {
            tool: invocation.sorter.to_string(),
            unit: invocation.unit.clone(),
            reason: format!("sorter options are not serializable: {e}"),
        })?;

        let mut args = self.sorter_command.clone();
        args.extend([
            "--sorter".to_string(),
            invocation.sorter.to_string(),
            "--output".to_string(),
            path_arg(&invocation.output_dir),
            "--options".to_string(),
            options,
        ]);
        for segment in &invocation.segments {
            args.push("--input".to_string());
            args.push(path_arg(segment));
        }
        Ok(args)
    }

    async fn run_local(&self, invocation: &SorterInvocation, args: &[String]) -> Result<(), ExternalToolError> {
        let mut command = self.command(invocation, args)?;
        command.current_dir(&invocation.working_dir);
        run_tool(invocation.sorter.as_str(), &invocation.unit, command).await?;
        Ok(())
    }

    async fn run_singularity(
        &self,
        invocation: &SorterInvocation,
        image: &Path,
        source: &str,
        args: &[String],
    ) -> Result<(), ExternalToolError> {
        if !image.is_file() {
            pull_singularity_image(invocation, image, source).await?;
        }

        let mut exec = vec![SINGULARITY.to_string(), "exec".to_string()];
        if invocation.sorter.is_kilosort() {
            exec.push("--nv".to_string());
        }
        exec.extend([
            "--bind".to_string(),
            identity_bind(&invocation.data_root),
            "--pwd".to_string(),
            path_arg(&invocation.working_dir),
            path_arg(image),
        ]);
        exec.extend(args.iter().cloned());

        let mut command = self.command(invocation, &exec)?;
        command.current_dir(&invocation.working_dir);
        run_tool(SINGULARITY, &invocation.unit, command).await?;
        Ok(())
    }

    async fn run_docker(
        &self,
        invocation: &SorterInvocation,
        image: &str,
        args: Vec<String>,
    ) -> Result<(), ExternalToolError> {
        let docker_failure = |status: String| ExternalToolError::Failed {
            tool: DOCKER_TOOL.to_string(),
            unit: invocation.unit.clone(),
            status,
            detail: String::new(),
        };

        let client = DockerClient::new().map_err(|e| docker_failure(e.to_string()))?;
        let name = format!(
            "spikeflow-{}-{}",
            invocation.sorter,
            uuid::Uuid::new_v4().simple()
        );
        let config = ContainerConfig::new(name, image)
            .with_cmd(args)
            .with_working_dir(path_arg(&invocation.working_dir))
            .with_identity_bind(path_arg(&invocation.data_root))
            .with_gpus(invocation.sorter.is_kilosort());

        let run = client
            .run_to_completion(&config)
            .await
            .map_err(|e| docker_failure(e.to_string()))?;

        if run.exit_code != 0 {
            return Err(ExternalToolError::Failed {
                tool: invocation.sorter.to_string(),
                unit: invocation.unit.clone(),
                status: format!("exit code {}", run.exit_code),
                detail: tail(&run.logs, LOG_TAIL_LINES),
            });
        }
        Ok(())
    }

    fn command(&self, invocation: &SorterInvocation, parts: &[String]) -> Result<Command, ExternalToolError> {
        command_from(parts).ok_or_else(|| ExternalToolError::InvalidOutput {
            tool: invocation.sorter.to_string(),
            unit: invocation.unit.clone(),
            reason: "no sorter command configured".to_string(),
        })
    }
}

#[async_trait]
impl SorterRuntime for IsolatedSorterRuntime {
    async fn run(&self, invocation: &SorterInvocation) -> Result<(), ExternalToolError> {
        let args = self.sorter_args(invocation)?;
        info!(
            sorter = %invocation.sorter,
            unit = %invocation.unit,
            image = %invocation.image,
            segments = invocation.segments.len(),
            "Running sorter"
        );

        match &invocation.image {
            IsolationImage::Local => self.run_local(invocation, &args).await,
            IsolationImage::Singularity { image, source } => {
                self.run_singularity(invocation, image, source, &args).await
            }
            IsolationImage::Docker { image } => self.run_docker(invocation, image, args).await,
        }
    }
}

async fn pull_singularity_image(
    invocation: &SorterInvocation,
    image: &Path,
    source: &str,
) -> Result<(), ExternalToolError> {
    if let Some(parent) = image.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ExternalToolError::Launch {
                tool: SINGULARITY.to_string(),
                unit: invocation.unit.clone(),
                source,
            })?;
    }

    warn!(image = %image.display(), source, "Singularity image not found, pulling");
    let mut command = Command::new(SINGULARITY);
    command.arg("pull").arg(image).arg(source);
    run_tool("singularity pull", &invocation.unit, command).await?;
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn identity_bind(path: &Path) -> String {
    let path = path_arg(path);
    format!("{path}:{path}")
}
