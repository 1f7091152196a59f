//! Time-bounded execution of external programs.
//!
//! The T2 fitting step is delegated to a separate executable. This module runs
//! it on the tokio runtime, captures its output and kills it if it overruns.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Result of running an external program to completion (or timeout).
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Exit code, `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Time taken in milliseconds.
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// One-line description of a failed run.
    pub fn failure_message(&self) -> String {
        if self.timed_out {
            return format!("timed out after {} ms", self.elapsed_ms);
        }
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none (terminated by signal)".to_string());
        let output = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if output.is_empty() {
            format!("exit code {}", code)
        } else {
            format!("exit code {}: {}", code, output)
        }
    }
}

/// Runs `program` with `args` and waits up to `timeout` for it to finish.
///
/// Failing to start the program is an error; a non-zero exit or a timeout is
/// reported through the returned [`ProcessOutcome`].
pub async fn run_process<S: AsRef<OsStr>>(program: &str, args: &[S], timeout: Duration) -> Result<ProcessOutcome> {
    let start = Instant::now();

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;

    // dropping the wait future on timeout drops the child, which kills it
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("Failed to wait for {}", program))?;
            Ok(ProcessOutcome {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                elapsed_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
            })
        }
        Err(_) => Ok(ProcessOutcome {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: start.elapsed().as_millis() as u64,
            timed_out: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let args: [&str; 0] = [];
        let result = run_process("nonexistent_t2mapping_binary_xyz", &args, Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_and_output_captured() {
        let outcome = run_process("sh", &["-c", "echo fitted; echo bad echo >&2; exit 3"], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        assert_eq!(outcome.stdout.trim(), "fitted");
        assert_eq!(outcome.failure_message(), "exit code 3: bad echo");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let outcome = run_process("sh", &["-c", "sleep 30"], Duration::from_millis(200)).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(outcome.elapsed_ms < 30_000);
    }
}
