//! Host-side process execution with a hard deadline
//!
//! Shared by the `virsh`/`qemu-img` hypervisor driver and the `ssh` session
//! backend. Output is captured in full rather than streamed.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of a process that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code (-1 when terminated by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Why a process did not produce an exit status
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// Run `program` with `args`, capturing stdout and stderr.
///
/// The child is killed if it has not exited within `timeout`.
///
/// # Returns
/// * `Ok(ProcessOutput)` - the process exited (with any code)
/// * `Err(ProcessError::TimedOut)` - deadline hit, child killed
/// * `Err(ProcessError::Spawn)` - the binary could not be started or waited on
pub async fn run_captured(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError> {
    debug!(
        cmd = %program,
        args = ?args,
        timeout_secs = timeout.as_secs(),
        "Running command"
    );

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    // Dropping the wait future on timeout drops the child, which kills it
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(source)) => Err(ProcessError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => {
            warn!(
                cmd = %program,
                timeout_secs = timeout.as_secs(),
                "Command timed out, killing process"
            );
            Err(ProcessError::TimedOut {
                program: program.to_string(),
                timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let output = run_captured("sh", &["-c", "echo out; echo err >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.diagnostic(), "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let err = run_captured("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = run_captured("/nonexistent/kvm-bench-binary", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_diagnostic_falls_back_to_stdout() {
        let output = ProcessOutput {
            exit_code: 1,
            stdout: "  only stdout \n".into(),
            stderr: "   ".into(),
        };
        assert_eq!(output.diagnostic(), "only stdout");
    }
}
