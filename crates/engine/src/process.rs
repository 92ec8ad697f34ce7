//! Scoped subprocess execution for the external database tools.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use dbvault_core::EngineError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Longest stderr excerpt carried in a [`EngineError::ToolFailed`].
const STDERR_EXCERPT: usize = 4096;

/// One invocation of an external binary. Secrets go in `env`, never in `args`.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    /// Name used in errors and logs.
    pub tool: String,
    /// Binary name looked up on PATH, or a path to it.
    pub program: String,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(tool: &str, program: &str, timeout: Duration) -> Self {
        Self {
            tool: tool.to_owned(),
            program: program.to_owned(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_owned(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Resolves the binary up front and fails with `ToolUnavailable` when it is missing.
pub fn resolve(tool: &str, program: &str) -> Result<PathBuf, EngineError> {
    which::which(program).map_err(|_| EngineError::ToolUnavailable {
        tool: tool.to_owned(),
    })
}

/// Runs the command to completion with captured output.
///
/// The child is killed and reaped when the timeout elapses, and killed on drop
/// if the awaiting future is abandoned.
pub async fn run(cmd: &ToolCommand) -> Result<ToolOutput, EngineError> {
    let binary = resolve(&cmd.tool, &cmd.program)?;
    let mut child = Command::new(&binary)
        .args(&cmd.args)
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            tracing::warn!(tool = %cmd.tool, binary = %binary.display(), error = %e, "spawn failed");
            EngineError::ToolUnavailable {
                tool: cmd.tool.clone(),
            }
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match tokio::time::timeout(cmd.timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            stdout.abort();
            stderr.abort();
            return Err(EngineError::ToolFailed {
                tool: cmd.tool.clone(),
                code: -1,
                stderr: e.to_string(),
            });
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(tool = %cmd.tool, error = %e, "failed to kill timed out tool");
            }
            stdout.abort();
            stderr.abort();
            return Err(EngineError::ToolTimeout {
                tool: cmd.tool.clone(),
                secs: cmd.timeout.as_secs(),
            });
        }
    };

    let stdout = stdout.await.unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr.await.unwrap_or_default()).into_owned();

    if !status.success() {
        return Err(EngineError::ToolFailed {
            tool: cmd.tool.clone(),
            code: status.code().unwrap_or(-1),
            stderr: excerpt(&stderr),
        });
    }
    tracing::debug!(tool = %cmd.tool, stdout_bytes = stdout.len(), "tool finished");
    Ok(ToolOutput { stdout, stderr })
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT {
        return trimmed.to_owned();
    }
    let mut end = STDERR_EXCERPT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
