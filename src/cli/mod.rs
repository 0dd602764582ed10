//! Command-line interface for spikeflow.
//!
//! Provides the pipeline commands (`run`, `preprocess`, `sort`), the batch
//! worker entry point and an environment check.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, PipelineArgs, RunTaskArgs};
