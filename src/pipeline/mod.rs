//! Pipeline orchestration.
//!
//! # Pipeline Flow
//!
//! 1. **Plan**: validate the request, build the run tree, load the processing
//!    config and resolve the sorter image
//! 2. **Preflight**: decide every preprocess and sort output up front, so a
//!    refused output aborts before any external call
//! 3. **Preprocess**: one staged output per run
//! 4. **Concatenate**: group usable runs into sorting units
//! 5. **Sort**: one sorter invocation per unit
//! 6. **Quality check**: metrics beside each usable sorter output
//!
//! # Example
//!
//! ```rust,ignore
//! use spikeflow::config::{PipelineConfig, Sorter};
//! use spikeflow::pipeline::{PipelineOrchestrator, PipelineRequest, PipelineStage};
//! use spikeflow::tree::SessionSelection;
//!
//! let orchestrator = PipelineOrchestrator::from_config(PipelineConfig::from_env()?);
//! let request = PipelineRequest::new(
//!     "/data/project",
//!     "sub-001",
//!     vec![SessionSelection::named("ses-001", &["run-1", "run-2"])],
//!     Sorter::Kilosort2_5,
//! )
//! .with_concat_runs(true);
//!
//! let report = orchestrator.run(&request, PipelineStage::Full).await?;
//! ```

pub mod orchestrator;
pub mod report;
pub mod request;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use orchestrator::{PipelineOrchestrator, PipelinePlan, PreparedRun};
pub use report::PipelineReport;
pub use request::{BatchOptions, IntermediateFile, PipelineRequest};

/// Which part of the pipeline an invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Preprocess, sort and quality-check.
    Full,
    PreprocessOnly,
    /// Sort and quality-check existing preprocessed data.
    SortOnly,
}

impl PipelineStage {
    pub fn preprocesses(&self) -> bool {
        !matches!(self, PipelineStage::SortOnly)
    }

    pub fn sorts(&self) -> bool {
        !matches!(self, PipelineStage::PreprocessOnly)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Full => write!(f, "full"),
            PipelineStage::PreprocessOnly => write!(f, "preprocess"),
            PipelineStage::SortOnly => write!(f, "sort"),
        }
    }
}
