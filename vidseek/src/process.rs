use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run `cmd` to completion and collect its output.
///
/// The child is killed if the deadline passes or the caller's future is
/// dropped, so session cleanup never waits on a stuck external tool.
/// Spawn failures come back as [`Error::Io`] for the caller to classify.
pub(crate) async fn run(
    mut cmd: Command,
    operation: &'static str,
    timeout: Option<Duration>,
) -> Result<Output> {
    cmd.kill_on_drop(true);
    debug!(operation, "spawning external command");

    let output = match timeout {
        Some(after) => match tokio::time::timeout(after, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(operation, after_secs = after.as_secs_f64(), "external command timed out");
                return Err(Error::Timeout { operation, after });
            }
        },
        None => cmd.output().await?,
    };
    Ok(output)
}

/// First 1000 characters of a child's stderr, for error messages.
pub(crate) fn stderr_excerpt(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr)
        .trim()
        .chars()
        .take(1000)
        .collect()
}

pub(crate) fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_collects_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let output = run(cmd, "sh", None).await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(stderr_excerpt(&output), "err");
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = std::time::Instant::now();
        let err = run(cmd, "sleep", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "sleep", .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let err = run(Command::new("/nonexistent/tool"), "tool", None)
            .await
            .unwrap_err();
        assert!(is_not_found(&err));
    }
}
