//! External collaborators.
//!
//! Numerical preprocessing, spike sorting and quality metrics are done by
//! external tools. The orchestrator reaches them only through the traits in
//! this module; `command` has the process-based implementations and
//! [`crate::execution`] the container runtimes for sorters.

pub mod command;
pub mod process;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;

use crate::config::{IsolationImage, Sorter, StepSpec};
use crate::error::{ConsistencyError, ExternalToolError, PipelineError};
use crate::tree::{ArtifactChain, RunKey, StepArtifact};

pub use command::{CommandPreprocessor, CommandQualityEngine};

/// Raw input of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecording {
    pub run: RunKey,
    pub path: PathBuf,
}

/// A preprocessing chain applied to a raw recording, not yet computed.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyRecording {
    pub raw: RawRecording,
    pub steps: Vec<StepSpec>,
    pub chain: ArtifactChain,
}

impl LazyRecording {
    /// The step that `materialize` writes.
    pub fn final_step(&self) -> Result<&StepArtifact, ConsistencyError> {
        self.chain.last()
    }
}

/// Turns raw recordings into preprocessed ones.
#[async_trait]
pub trait PreprocessingEngine: Send + Sync {
    /// Describes the chain without any I/O.
    fn apply(&self, steps: &[StepSpec], raw: RawRecording) -> Result<LazyRecording, ConsistencyError> {
        let chain = ArtifactChain::from_step_names(
            raw.run.to_string(),
            steps.iter().map(|s| s.name.as_str()),
        )?;
        Ok(LazyRecording {
            raw,
            steps: steps.to_vec(),
            chain,
        })
    }

    /// Computes the final step of `recording` into `destination`.
    ///
    /// `destination` exists and is empty when this is called.
    async fn materialize(&self, recording: &LazyRecording, destination: &Path) -> Result<(), PipelineError>;
}

/// Everything a sorter needs for one sorting unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SorterInvocation {
    pub sorter: Sorter,
    /// Unit label used in errors and logs.
    pub unit: String,
    /// Preprocessed inputs in concatenation order.
    pub segments: Vec<PathBuf>,
    /// Empty directory the sorter writes into.
    pub output_dir: PathBuf,
    pub options: Mapping,
    pub image: IsolationImage,
    /// Directory the sorter process runs in.
    pub working_dir: PathBuf,
    /// Host tree mounted at the same path inside containers.
    pub data_root: PathBuf,
}

/// Runs a sorter under some isolation.
#[async_trait]
pub trait SorterRuntime: Send + Sync {
    async fn run(&self, invocation: &SorterInvocation) -> Result<(), ExternalToolError>;
}

/// One row of a metrics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub unit_id: serde_json::Value,
    pub values: Vec<serde_json::Value>,
}

/// Per-unit quality metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsTable {
    pub columns: Vec<String>,
    pub rows: Vec<MetricsRow>,
}

impl MetricsTable {
    /// Rejects rows whose width does not match the header.
    pub fn validate(&self) -> Result<(), String> {
        for row in &self.rows {
            if row.values.len() != self.columns.len() {
                return Err(format!(
                    "row for unit {} has {} values but there are {} columns",
                    row.unit_id,
                    row.values.len(),
                    self.columns.len()
                ));
            }
        }
        Ok(())
    }
}

/// Computes quality metrics for a sorter output.
#[async_trait]
pub trait QualityEngine: Send + Sync {
    async fn compute(&self, sorter_output: &Path, unit: &str) -> Result<MetricsTable, ExternalToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl PreprocessingEngine for Noop {
        async fn materialize(&self, _: &LazyRecording, _: &Path) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    #[test]
    fn test_apply_is_lazy_and_keyed() {
        let raw = RawRecording {
            run: RunKey::new("ses-1", "r1"),
            path: PathBuf::from("/does/not/exist"),
        };
        let steps = vec![StepSpec::new("phase_shift"), StepSpec::new("bandpass_filter")];
        let lazy = Noop.apply(&steps, raw).unwrap();

        assert_eq!(lazy.chain.len(), 3);
        assert_eq!(lazy.final_step().unwrap().key, "2-raw-phase_shift-bandpass_filter");
    }

    #[test]
    fn test_metrics_table_from_json() {
        let table: MetricsTable = serde_json::from_value(json!({
            "columns": ["firing_rate", "snr"],
            "rows": [{"unit_id": 0, "values": [1.5, 4.2]}]
        }))
        .unwrap();
        assert!(table.validate().is_ok());

        let ragged = MetricsTable {
            columns: vec!["snr".to_string()],
            rows: vec![MetricsRow { unit_id: json!(1), values: vec![] }],
        };
        assert!(ragged.validate().is_err());
    }
}
