//! Child-process plumbing shared by the command-based collaborators.

use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::error::ExternalToolError;

/// Lines of stderr kept in error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Captured output of a successful tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Builds a command from `program arg...`.
pub fn command_from(parts: &[String]) -> Option<Command> {
    let (program, args) = parts.split_first()?;
    let mut command = Command::new(program);
    command.args(args);
    Some(command)
}

/// Runs `command` to completion for `unit`.
///
/// The child is killed if the returned future is dropped, so cancelling the
/// pipeline never leaves a tool writing into a discarded staging directory.
pub async fn run_tool(tool: &str, unit: &str, mut command: Command) -> Result<ToolOutput, ExternalToolError> {
    command.kill_on_drop(true).stdin(Stdio::null());
    debug!(tool, unit, command = ?command.as_std(), "Launching external tool");

    let output = command
        .output()
        .await
        .map_err(|source| ExternalToolError::Launch {
            tool: tool.to_string(),
            unit: unit.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ExternalToolError::Failed {
            tool: tool.to_string(),
            unit: unit.to_string(),
            status: describe_status(output.status),
            detail: tail(&stderr, STDERR_TAIL_LINES),
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Whether `program args...` runs and exits successfully.
pub async fn probe(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

pub fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "terminated abnormally".to_string()
}

/// Last `lines` lines of `text`.
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
