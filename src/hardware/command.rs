//! Subprocess helper shared by every tool-backed collaborator.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{BspError, Result};

/// Run `program` with `args` and return its stdout.
///
/// A non-zero exit, a spawn failure, or an expired deadline is a [`BspError::Tool`].
/// The child is killed if the deadline expires.
pub async fn run_tool<S: AsRef<str>>(
    program: &Path,
    args: &[S],
    deadline: Option<Duration>,
) -> Result<String> {
    let program_name = program.display().to_string();
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    debug!(program = %program_name, args = ?args, "Running tool");

    let mut command = Command::new(program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| BspError::tool(&program_name, format!("failed to spawn: {e}")))?;

    let output = match deadline {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| {
                BspError::tool(&program_name, format!("timed out after {limit:?}"))
            })?,
        None => child.wait_with_output().await,
    }
    .map_err(|e| BspError::tool(&program_name, format!("failed to collect output: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    trace!(program = %program_name, stdout = %stdout, "Tool output");

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BspError::tool(
            &program_name,
            format!("{} ({})", stderr.trim(), output.status),
        ));
    }
    Ok(stdout)
}
