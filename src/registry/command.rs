//! Command-backed functions: run an executable for one attempt.
//!
//! The arguments go to stdin as JSON and the attempt context goes to the
//! environment. Stdout is the success value, parsed as JSON when it parses.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{CommandFunction, HandlerResult, Invocation};

/// Longest stderr excerpt carried into a failure message.
const STDERR_TAIL: usize = 512;

pub async fn run(function: &CommandFunction, inv: Invocation) -> HandlerResult {
    run_inner(function, inv).await.map_err(|e| e.to_string())?
}

async fn run_inner(function: &CommandFunction, inv: Invocation) -> std::io::Result<HandlerResult> {
    // Resolve relative command paths against the process CWD, not whatever
    // the child ends up in.
    let command = if function.command.is_relative() {
        std::env::current_dir()?.join(&function.command)
    } else {
        function.command.clone()
    };

    debug!(
        function = %function.name,
        work_id = %inv.work_id,
        attempt = inv.attempt,
        command = %command.display(),
        "running command"
    );

    let mut child = Command::new(&command)
        .args(&function.args)
        .env("WORKPOOL_FUNCTION", &function.name)
        .env("WORKPOOL_WORK_ID", inv.work_id.to_string())
        .env("WORKPOOL_ATTEMPT", inv.attempt.to_string())
        .env("WORKPOOL_KIND", inv.kind.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&inv.args).map_err(std::io::Error::other)?;
        // A command that ignores its input may exit before we finish writing.
        if let Err(e) = stdin.write_all(&payload).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail_chars(stderr.trim(), STDERR_TAIL);
        return Ok(Err(format!(
            "{} exited with status {}: {tail}",
            function.name,
            output.status.code().unwrap_or(-1)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    let value = if stdout.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(stdout).unwrap_or_else(|_| serde_json::Value::String(stdout.to_string()))
    };
    Ok(Ok(value))
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    let idx = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[idx..]
}
