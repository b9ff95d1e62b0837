//! Local execution of generated agent code
//!
//! The code runs in a Python subprocess under a small harness that reports
//! tokens as JSON lines. A producer task owns the subprocess and feeds its
//! output into a channel; the consumer turns lines into SSE frames. The
//! sequence always finishes with one `end` frame.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::code::analyze;
use crate::errors::BackendError;
use crate::exec::protocol::HarnessLine;
use crate::filesys::dir::Dir;
use crate::invoke::response::FrameStream;
use crate::invoke::sse::{FrameKind, SseFrame};
use crate::tooling::runner::{CommandOutput, CommandRunner, CommandSpec, OutputLine};
use crate::utils::tail;

pub const HARNESS: &str = include_str!("../../templates/local_runner.py");
const HARNESS_FILE: &str = "local_runner.py";
const CODE_FILE: &str = "agent.py";
const STDERR_TAIL: usize = 20;

/// How the harness pulls output out of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Iterate `main()` as an async generator
    Drain,
    /// Replace `print` and collect what it is given
    Capture,
}

impl Strategy {
    pub fn for_code(code: &str) -> Self {
        if code.contains("async def main") && analyze(code).main_is_generator() {
            Strategy::Drain
        } else {
            Strategy::Capture
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Drain => "drain",
            Strategy::Capture => "capture",
        }
    }
}

/// Result of a non-streaming run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub strategy: Strategy,
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub python_bin: String,
    pub timeout: Duration,
    /// How long the consumer waits for a line before checking the producer
    pub poll_interval: Duration,
}

/// Aborts the producer, and with it the subprocess, if the consumer goes away
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct LocalExecutor {
    runner: Arc<dyn CommandRunner>,
    options: ExecutorOptions,
}

impl LocalExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, options: ExecutorOptions) -> Self {
        Self { runner, options }
    }

    /// Start the code and stream its output
    pub async fn stream(&self, code: &str, user_input: &str) -> Result<FrameStream, BackendError> {
        let strategy = Strategy::for_code(code);
        let (scratch, dir) = Dir::scratch("strands-exec")?;
        let harness = dir.file(HARNESS_FILE);
        harness.write_string(HARNESS).await?;
        let source = dir.file(CODE_FILE);
        source.write_string(code).await?;

        let spec = CommandSpec::new(
            &self.options.python_bin,
            [
                harness.path().display().to_string(),
                source.path().display().to_string(),
                strategy.as_str().to_string(),
            ],
        )
        .cwd(dir.path())
        .env("PYTHONUNBUFFERED", "1")
        .stdin(user_input)
        .timeout(self.options.timeout);
        info!("Running agent locally ({} strategy)", strategy.as_str());

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = self.runner.clone();
        let producer = tokio::spawn(async move { runner.run_streaming(&spec, tx).await });

        Ok(consume(
            rx,
            AbortOnDrop(producer),
            self.options.poll_interval,
            scratch,
        ))
    }

    /// Run to completion and collect the output into one result
    pub async fn execute(&self, code: &str, user_input: &str) -> Result<ExecutionResult, BackendError> {
        use futures::StreamExt;

        let strategy = Strategy::for_code(code);
        let mut frames = self.stream(code, user_input).await?;
        let mut output = String::new();
        let mut error = None;
        while let Some(frame) = frames.next().await {
            match frame.kind {
                FrameKind::Message => output.push_str(&frame.text()),
                FrameKind::Error => error = Some(frame.text()),
                FrameKind::End => break,
            }
        }
        Ok(ExecutionResult {
            success: error.is_none(),
            output,
            error,
            strategy,
        })
    }
}

fn consume<G: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<OutputLine>,
    mut producer: AbortOnDrop<Result<CommandOutput, BackendError>>,
    poll_interval: Duration,
    scratch: G,
) -> FrameStream {
    Box::pin(async_stream::stream! {
        let _scratch = scratch;
        let mut saw_error = false;
        let mut stderr: Vec<String> = Vec::new();

        loop {
            match tokio::time::timeout(poll_interval, rx.recv()).await {
                Ok(Some(OutputLine::Stdout(line))) => match HarnessLine::parse(&line) {
                    Some(HarnessLine::End) => {}
                    Some(parsed) => {
                        let frame = parsed.into_frame();
                        if frame.kind == FrameKind::Error {
                            if saw_error {
                                continue;
                            }
                            saw_error = true;
                        }
                        yield frame;
                    }
                    None => debug!("Ignoring harness output: {}", line),
                },
                Ok(Some(OutputLine::Stderr(line))) => {
                    debug!("agent: {}", line);
                    stderr.push(line);
                }
                Ok(None) => break,
                Err(_) => {
                    if producer.0.is_finished() && rx.is_empty() {
                        break;
                    }
                }
            }
        }

        let outcome = (&mut producer.0).await;
        if !saw_error {
            let message = match outcome {
                Ok(Ok(output)) if output.success() => None,
                Ok(Ok(output)) => Some(exit_message(&output, &stderr)),
                Ok(Err(BackendError::Timeout { waited_secs, .. })) => {
                    warn!("Local execution timed out after {}s", waited_secs);
                    Some(format!("Execution timed out after {}s", waited_secs))
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("execution task failed: {}", e)),
            };
            if let Some(message) = message {
                yield SseFrame::error(&message);
            }
        }
        yield SseFrame::end();
    })
}

fn exit_message(output: &CommandOutput, stderr: &[String]) -> String {
    let code = output
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let detail = tail(stderr, STDERR_TAIL).join("\n");
    if detail.is_empty() {
        format!("Agent process exited with code {}", code)
    } else {
        format!("Agent process exited with code {}: {}", code, detail)
    }
}
