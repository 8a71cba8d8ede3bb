//! Child process execution with timeouts.

use anyhow::{Context, Result};
use log::debug;
use std::path::PathBuf;
use std::time::Duration;

use super::RealRuntime;

/// A program invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// The process did not finish before its timeout and was killed.
#[derive(Debug)]
pub struct CommandTimedOut {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl std::fmt::Display for CommandTimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} did not finish within {}s",
            self.program.display(),
            self.timeout.as_secs_f64()
        )
    }
}

impl std::error::Error for CommandTimedOut {}

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) async fn run_command_impl(&self, request: &CommandRequest) -> Result<CommandOutput> {
        debug!("Running {:?} {:?}", request.program, request.args);

        let mut command = tokio::process::Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let output = match tokio::time::timeout(request.timeout, command.output()).await {
            Ok(output) => {
                output.with_context(|| format!("Failed to run {:?}", request.program))?
            }
            Err(_) => {
                return Err(CommandTimedOut {
                    program: request.program.clone(),
                    timeout: request.timeout,
                }
                .into());
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let request = CommandRequest::new("/bin/sh", Duration::from_secs(10))
            .args(["-c", "echo out; echo err >&2; exit 3"]);

        let output = RealRuntime.run_command(&request).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_command_passes_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let request = CommandRequest::new("/bin/sh", Duration::from_secs(10))
            .args(["-c", "echo \"$GREETING\"; pwd"])
            .env("GREETING", "hello")
            .cwd(dir.path());

        let output = RealRuntime.run_command(&request).await.unwrap();
        assert!(output.success());
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            std::fs::canonicalize(cwd).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let request =
            CommandRequest::new("/bin/sh", Duration::from_millis(100)).args(["-c", "sleep 5"]);

        let err = RealRuntime.run_command(&request).await.unwrap_err();
        assert!(err.downcast_ref::<CommandTimedOut>().is_some());
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let request = CommandRequest::new("/nonexistent/program", Duration::from_secs(1));
        let err = RealRuntime.run_command(&request).await.unwrap_err();
        assert!(err.downcast_ref::<CommandTimedOut>().is_none());
    }
}
