//! Process-based preprocessing and quality-metric engines.
//!
//! Both launch a configured command line. The preprocessing command receives
//! the raw path, the step chain as JSON and the output directory; the quality
//! command receives the sorter output and prints a JSON [`MetricsTable`].

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use super::process::{command_from, run_tool};
use super::{LazyRecording, MetricsTable, PreprocessingEngine, QualityEngine};
use crate::error::{ExternalToolError, PipelineError};

const PREPROCESS_TOOL: &str = "preprocessing";
const QUALITY_TOOL: &str = "quality metrics";

/// Preprocessing through an external command.
#[derive(Debug, Clone)]
pub struct CommandPreprocessor {
    command: Vec<String>,
}

impl CommandPreprocessor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl PreprocessingEngine for CommandPreprocessor {
    async fn materialize(&self, recording: &LazyRecording, destination: &Path) -> Result<(), PipelineError> {
        let unit = recording.raw.run.to_string();
        let final_step = recording.final_step()?;
        let steps = serde_json::to_string(&recording.steps)?;

        let mut command = command_from(&self.command).ok_or_else(|| ExternalToolError::InvalidOutput {
            tool: PREPROCESS_TOOL.to_string(),
            unit: unit.clone(),
            reason: "no preprocessing command configured".to_string(),
        })?;
        command
            .arg("--input")
            .arg(&recording.raw.path)
            .arg("--steps")
            .arg(&steps)
            .arg("--step-key")
            .arg(&final_step.key)
            .arg("--output")
            .arg(destination);

        info!(unit = %unit, step = %final_step.key, "Materializing preprocessed recording");
        run_tool(PREPROCESS_TOOL, &unit, command).await?;
        Ok(())
    }
}

/// Quality metrics through an external command.
#[derive(Debug, Clone)]
pub struct CommandQualityEngine {
    command: Vec<String>,
}

impl CommandQualityEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl QualityEngine for CommandQualityEngine {
    async fn compute(&self, sorter_output: &Path, unit: &str) -> Result<MetricsTable, ExternalToolError> {
        let invalid = |reason: String| ExternalToolError::InvalidOutput {
            tool: QUALITY_TOOL.to_string(),
            unit: unit.to_string(),
            reason,
        };

        let mut command =
            command_from(&self.command).ok_or_else(|| invalid("no quality command configured".to_string()))?;
        command.arg("--sorting").arg(sorter_output);

        let output = run_tool(QUALITY_TOOL, unit, command).await?;
        let table: MetricsTable =
            serde_json::from_str(output.stdout.trim()).map_err(|e| invalid(format!("not a metrics table: {e}")))?;
        table.validate().map_err(invalid)?;
        Ok(table)
    }
}
