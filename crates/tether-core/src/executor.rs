//! Local execution of tool calls the agent refused but the user approved.
//!
//! Only three tools are supported: `Bash`, `Write` and `Edit`. Anything else
//! fails with [`ToolError::Unsupported`]. Whatever happens, the caller turns
//! the outcome into a report with [`approved_report`] and sends it back to the
//! agent as the next user turn.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::ExecutorConfig;
use crate::text::lossy_bounded;
use crate::tracker::ToolInvocation;

/// Failure of a local tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tool} requires a non-empty '{field}'")]
    MissingInput { tool: String, field: &'static str },

    #[error("Tool '{0}' is not supported for manual execution")]
    Unsupported(String),

    #[error("Text to replace not found in {}", path.display())]
    TextNotFound { path: PathBuf },

    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Command exited with {} and produced no output", exit_label(*code))]
    CommandFailed { code: Option<i32> },

    #[error("Failed to spawn shell: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Where and how a session's tool calls run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub cwd: PathBuf,
    /// Complete environment for spawned commands. Nothing is inherited.
    pub env: HashMap<String, String>,
    pub limits: ExecutorConfig,
}

impl ExecutionContext {
    pub fn new(cwd: PathBuf, env: HashMap<String, String>, limits: ExecutorConfig) -> Self {
        Self { cwd, env, limits }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalToolExecutor;

impl LocalToolExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Whether `tool_name` can be executed locally at all.
    pub fn supports(tool_name: &str) -> bool {
        matches!(tool_name, "Bash" | "Write" | "Edit")
    }

    /// Runs one approved invocation and returns its result text.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        invocation: &ToolInvocation,
    ) -> Result<String, ToolError> {
        tracing::info!(
            tool = %invocation.name,
            tool_use_id = %invocation.id,
            cwd = %ctx.cwd.display(),
            "Executing approved tool call"
        );
        match invocation.name.as_str() {
            "Bash" => {
                let command = required_str(invocation, "command")?;
                run_shell(ctx, command).await
            }
            "Write" => {
                let path = ctx.resolve(required_str(invocation, "file_path")?);
                let content = string_field(invocation, "content")?;
                with_file_timeout(ctx, write_file(&path, content)).await
            }
            "Edit" => {
                let path = ctx.resolve(required_str(invocation, "file_path")?);
                let old = string_field(invocation, "old_string")?;
                if old.is_empty() {
                    return Err(ToolError::MissingInput {
                        tool: invocation.name.clone(),
                        field: "old_string",
                    });
                }
                let new = string_field(invocation, "new_string")?;
                with_file_timeout(ctx, replace_first(&path, old, new)).await
            }
            other => Err(ToolError::Unsupported(other.to_string())),
        }
    }
}

fn required_str<'a>(
    invocation: &'a ToolInvocation,
    field: &'static str,
) -> Result<&'a str, ToolError> {
    match invocation.input.get(field).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ToolError::MissingInput {
            tool: invocation.name.clone(),
            field,
        }),
    }
}

/// A string field that must be present but may be empty.
fn string_field<'a>(
    invocation: &'a ToolInvocation,
    field: &'static str,
) -> Result<&'a str, ToolError> {
    invocation
        .input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::MissingInput {
            tool: invocation.name.clone(),
            field,
        })
}

async fn with_file_timeout(
    ctx: &ExecutionContext,
    operation: impl Future<Output = Result<String, ToolError>>,
) -> Result<String, ToolError> {
    let timeout = ctx.limits.file_timeout();
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| ToolError::Timeout {
            operation: "File operation",
            timeout,
        })?
}

async fn write_file(path: &Path, content: &str) -> Result<String, ToolError> {
    let io_err = |source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, content).await.map_err(io_err)?;
    Ok(format!("Wrote {} bytes to {}", content.len(), path.display()))
}

async fn replace_first(path: &Path, old: &str, new: &str) -> Result<String, ToolError> {
    let io_err = |source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    };
    let contents = tokio::fs::read_to_string(path).await.map_err(io_err)?;
    if !contents.contains(old) {
        return Err(ToolError::TextNotFound {
            path: path.to_path_buf(),
        });
    }
    tokio::fs::write(path, contents.replacen(old, new, 1))
        .await
        .map_err(io_err)?;
    Ok(format!("Replaced 1 occurrence in {}", path.display()))
}

async fn run_shell(ctx: &ExecutionContext, command: &str) -> Result<String, ToolError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&ctx.cwd)
        .env_clear()
        .envs(&ctx.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ToolError::Spawn)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let max = ctx.limits.max_output_bytes;
    let timeout = ctx.limits.shell_timeout();

    let run = async {
        let (out, err, status) = tokio::join!(
            read_bounded(stdout, max),
            read_bounded(stderr, max),
            child.wait()
        );
        let io_err = |source| ToolError::Io {
            path: ctx.cwd.clone(),
            source,
        };
        Ok::<_, ToolError>((
            out.map_err(io_err)?,
            err.map_err(io_err)?,
            status.map_err(io_err)?,
        ))
    };

    let Ok(outcome) = tokio::time::timeout(timeout, run).await else {
        tracing::warn!(command = %command, "Shell command timed out, killing");
        let _ = child.start_kill();
        return Err(ToolError::Timeout {
            operation: "Shell command",
            timeout,
        });
    };
    let ((out, out_cut), (err, err_cut), status) = outcome?;

    let (stdout, out_cut2) = lossy_bounded(&out, max);
    let (stderr, err_cut2) = lossy_bounded(&err, max);
    let code = status.code();

    if !status.success() && stdout.trim().is_empty() && stderr.trim().is_empty() {
        return Err(ToolError::CommandFailed { code });
    }

    Ok(shell_report(
        &stdout,
        &stderr,
        code,
        (out_cut || out_cut2 || err_cut || err_cut2).then_some(max),
    ))
}

/// Reads up to `max` bytes, then drains the rest so the child never blocks on
/// a full pipe. The flag reports whether anything was discarded.
async fn read_bounded<R: AsyncRead + Unpin>(
    reader: Option<R>,
    max: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut buf = Vec::new();
    (&mut reader).take(max as u64).read_to_end(&mut buf).await?;
    let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((buf, discarded > 0))
}

fn shell_report(stdout: &str, stderr: &str, code: Option<i32>, truncated_at: Option<usize>) -> String {
    let mut sections = Vec::new();
    if !stdout.trim().is_empty() {
        sections.push(stdout.trim_end().to_string());
    }
    if !stderr.trim().is_empty() {
        sections.push(format!("stderr:\n{}", stderr.trim_end()));
    }
    if sections.is_empty() {
        sections.push("(no output)".to_string());
    }
    if let Some(max) = truncated_at {
        sections.push(format!("(output truncated to {max} bytes per stream)"));
    }
    sections.push(exit_label(code));
    sections.join("\n")
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code: {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Report for an approved call, successful or not.
pub fn approved_report(tool_name: &str, outcome: &Result<String, ToolError>) -> String {
    match outcome {
        Ok(result) => format!("[Tool approved and executed: {tool_name}]\n{result}"),
        Err(err) => format!("[Tool approved but failed: {tool_name}]\nError: {err}"),
    }
}

/// Report for a call the user refused.
pub fn denied_report(tool_name: &str) -> String {
    format!(
        "[Tool denied by user: {tool_name}]\nThe user denied permission for this tool call. \
         Do not retry it; continue without it or ask the user how to proceed."
    )
}
