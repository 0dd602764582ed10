//! spikeflow CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use std::time::Duration;

/// Exit status after an interrupt (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// How long an interrupted run waits for its sorter containers to go.
const CONTAINER_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level and the log file location
    let cli = spikeflow::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_file = cli.log_file();
    let guard = spikeflow::logging::init(&cli.log_level, log_file.as_deref());

    // Dropping the pipeline future kills child processes, removes staging dirs
    // and starts removing sorter containers
    let outcome = tokio::select! {
        result = spikeflow::cli::run_with_cli(cli) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(result) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "spikeflow failed");
            }
            drop(guard);
            result
        }
        None => {
            tracing::warn!("Interrupted");
            spikeflow::execution::finish_pending_removals(CONTAINER_CLEANUP_TIMEOUT).await;
            drop(guard);
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}
