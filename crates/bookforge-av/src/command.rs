//! Builder for executing external tool commands with timeout support.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bookforge_common::{Error, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Stderr lines kept for error messages in streaming mode.
const STDERR_TAIL_LINES: usize = 20;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// How a streamed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited successfully.
    Completed,
    /// The line callback asked to stop and the process was killed.
    Aborted,
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use bookforge_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> bookforge_common::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "quiet", "-print_format", "json", "-show_chapters"])
///     .arg("/path/to/book.aax")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if spawning fails, the process times out, or
    /// it exits with a non-zero status (message includes stderr).
    pub async fn execute(&self) -> Result<ToolOutput> {
        let program_name = self.program_name();

        let child = self
            .command()
            .spawn()
            .map_err(|e| Error::tool(&program_name, format!("failed to spawn: {e}")))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let tool_output = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };

                if !output.status.success() {
                    return Err(Error::tool(
                        program_name,
                        format!(
                            "exited with status {}: {}",
                            output.status,
                            tool_output.stderr.trim()
                        ),
                    ));
                }

                Ok(tool_output)
            }
            Ok(Err(e)) => Err(Error::tool(
                program_name,
                format!("I/O error waiting for process: {e}"),
            )),
            // The dropped future kills the child (kill_on_drop).
            Err(_elapsed) => Err(Error::tool(
                program_name,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }

    /// Execute the command, feeding each stdout line to `on_line`.
    ///
    /// When `on_line` returns `false` the process is killed and the run ends
    /// with [`RunOutcome::Aborted`]. Stderr is drained concurrently and its
    /// tail is included in the error for a non-zero exit.
    pub async fn execute_streaming<F>(&self, mut on_line: F) -> Result<RunOutcome>
    where
        F: FnMut(&str) -> bool,
    {
        let program_name = self.program_name();

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| Error::tool(&program_name, format!("failed to spawn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool(&program_name, "stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::tool(&program_name, "stderr was not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut lines = BufReader::new(stdout).lines();
        let read = async {
            while let Some(line) = lines.next_line().await? {
                if !on_line(line.trim()) {
                    return Ok::<_, std::io::Error>(false);
                }
            }
            Ok(true)
        };

        let keep_going = match tokio::time::timeout_at(deadline, read).await {
            Ok(Ok(keep_going)) => keep_going,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(Error::tool(program_name, format!("failed reading output: {e}")));
            }
            Err(_elapsed) => {
                let _ = child.kill().await;
                return Err(Error::tool(
                    program_name,
                    format!("timed out after {:?}", self.timeout),
                ));
            }
        };

        if !keep_going {
            tracing::info!(tool = %program_name, "Stopping process at caller request");
            if let Err(e) = child.kill().await {
                tracing::warn!(tool = %program_name, "Failed to kill process: {e}");
            }
            stderr_task.abort();
            return Ok(RunOutcome::Aborted);
        }

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(Error::tool(
                    program_name,
                    format!("I/O error waiting for process: {e}"),
                ))
            }
            Err(_elapsed) => {
                let _ = child.kill().await;
                return Err(Error::tool(
                    program_name,
                    format!("timed out after {:?}", self.timeout),
                ));
            }
        };

        if !status.success() {
            let tail = stderr_task.await.unwrap_or_default();
            return Err(Error::tool(
                program_name,
                format!("exited with status {status}: {}", tail.trim()),
            ));
        }

        Ok(RunOutcome::Completed)
    }
}
