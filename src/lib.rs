//! spikeflow: spike-sorting pipeline orchestrator.
//!
//! This library drives extracellular electrophysiology recordings through
//! preprocessing, optional concatenation, spike sorting and quality checks,
//! persisting every stage under a fixed derivatives layout.

// Core modules
pub mod cli;
pub mod concat;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod layout;
pub mod logging;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod stage;
pub mod storage;
pub mod tree;

// Re-export commonly used error types
pub use error::{
    ConfigurationError, ConsistencyError, ExternalToolError, PipelineError, SchedulerError,
};
