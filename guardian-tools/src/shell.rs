use crate::error::ExecutionError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Run `command` through `/bin/sh -c` on this machine.
///
/// Returns trimmed stdout on exit status 0, otherwise the exit status and
/// trimmed stderr.
pub(crate) async fn run_local(command: &str, timeout: Duration) -> Result<String, ExecutionError> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| ExecutionError::TimedOut(timeout.as_secs()))?
        .map_err(|e| ExecutionError::Io(e.to_string()))?;

    if !output.status.success() {
        return Err(ExecutionError::CommandFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
