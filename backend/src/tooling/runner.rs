//! External command execution

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::BackendError;

/// Default timeout for short tool invocations (version checks, describes)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A command to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Values masked when the command line is logged
    pub secrets: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    /// Command line suitable for logs
    pub fn display(&self) -> String {
        let mut line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        for secret in &self.secrets {
            line = line.replace(secret, "***");
        }
        line
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            _ => self.stderr.clone(),
        }
    }
}

/// One line of live command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Runs external tools
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing output. A non-zero exit is not an error here.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, BackendError>;

    /// Like `run`, forwarding each output line as it is produced
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        lines: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<CommandOutput, BackendError> {
        let output = self.run(spec).await?;
        for line in output.stdout.lines() {
            let _ = lines.send(OutputLine::Stdout(line.to_string()));
        }
        for line in output.stderr.lines() {
            let _ = lines.send(OutputLine::Stderr(line.to_string()));
        }
        Ok(output)
    }
}

/// Runs commands as child processes of this one
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

fn spawn_error(spec: &CommandSpec, err: std::io::Error) -> BackendError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BackendError::ToolingError(format!("`{}` is not installed or not on PATH", spec.program))
    } else {
        BackendError::IoError(err)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, BackendError> {
        let (tx, _rx) = mpsc::unbounded_channel();
        self.run_streaming(spec, tx).await
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        lines: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<CommandOutput, BackendError> {
        debug!("Running: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| spawn_error(spec, e))?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            drop(stdin);
        }

        let stdout_task = child.stdout.take().map(|stdout| {
            let tx = lines.clone();
            tokio::spawn(async move {
                let mut collected = String::new();
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let _ = tx.send(OutputLine::Stdout(line.clone()));
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            let tx = lines.clone();
            tokio::spawn(async move {
                let mut collected = String::new();
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let _ = tx.send(OutputLine::Stderr(line.clone()));
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("Command timed out after {:?}: {}", spec.timeout, spec.display());
                let _ = child.kill().await;
                return Err(BackendError::Timeout {
                    resource: format!("command `{}`", spec.program),
                    waited_secs: spec.timeout.as_secs(),
                });
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: stdout.trim_end().to_string(),
            stderr: stderr.trim_end().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_masks_secrets() {
        let spec = CommandSpec::new("sam", ["deploy", "--parameter-overrides", "ApiKey=sk-123"])
            .secret("sk-123");
        assert_eq!(spec.display(), "sam deploy --parameter-overrides ApiKey=***");
    }

    #[test]
    fn test_combined_output() {
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(output.combined(), "out\nerr");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("sh", ["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "oops");
        assert_eq!(output.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_streams_lines() {
        let runner = SystemRunner::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = CommandSpec::new("sh", ["-c", "echo one; echo two"]);
        runner.run_streaming(&spec, tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(OutputLine::Stdout("one".to_string())));
        assert_eq!(rx.recv().await, Some(OutputLine::Stdout("two".to_string())));
    }

    #[tokio::test]
    async fn test_missing_program_is_tooling_error() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("definitely-not-a-real-tool-xyz", Vec::<String>::new());
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, BackendError::ToolingError(_)));
    }
}
