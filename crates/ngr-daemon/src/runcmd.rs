//! External process execution.
//!
//! [`command`] streams the child's stdout and stderr line by line into the
//! agent's structured log; [`command_string`] captures both into a buffer.
//! Both wait for the child and report a non-zero exit as an error.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{error, info};

/// Errors from running external commands.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The child could not be spawned at all.
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        /// The command that failed to start.
        cmd: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Waiting on the child failed.
    #[error("failed to wait for {cmd}: {source}")]
    Wait {
        /// The command that was started.
        cmd: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The child exited non-zero (or was killed by a signal).
    #[error("{cmd} exited with status {code:?}: {output}")]
    Failed {
        /// The command that ran.
        cmd: String,
        /// Exit code; `None` when killed by a signal.
        code: Option<i32>,
        /// Captured output, empty in streaming mode.
        output: String,
    },
}

impl CommandError {
    /// The exit code of a failed command, if it ran at all.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => *code,
            _ => None,
        }
    }
}

/// Runs a command, streaming its output into the agent log.
///
/// Stdout lines are logged at INFO, stderr lines at ERROR, line-buffered.
///
/// # Errors
///
/// Returns [`CommandError::Failed`] for a non-zero exit and the spawn/wait
/// errors otherwise.
pub async fn command(cmd: &str, args: &[&str]) -> Result<(), CommandError> {
    info!(cmd, args = args.join(" "), "exec");

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_task = stdout.map(|pipe| tokio::spawn(log_lines(pipe, false)));
    let err_task = stderr.map(|pipe| tokio::spawn(log_lines(pipe, true)));

    let status = child.wait().await.map_err(|source| CommandError::Wait {
        cmd: cmd.to_string(),
        source,
    })?;

    if let Some(task) = out_task {
        let _ = task.await;
    }
    if let Some(task) = err_task {
        let _ = task.await;
    }

    if !status.success() {
        return Err(CommandError::Failed {
            cmd: cmd.to_string(),
            code: status.code(),
            output: String::new(),
        });
    }

    Ok(())
}

/// Runs a command and returns its merged, trimmed output.
///
/// # Errors
///
/// Returns [`CommandError::Failed`] carrying the merged output for a
/// non-zero exit.
pub async fn command_string(cmd: &str, args: &[&str]) -> Result<String, CommandError> {
    info!(cmd, args = args.join(" "), "exec");

    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;

    let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
    merged.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(CommandError::Failed {
            cmd: cmd.to_string(),
            code: output.status.code(),
            output: merged,
        });
    }

    Ok(merged.trim().to_string())
}

/// Locates `name` on the `$PATH`.
///
/// `which` exiting with code 1 means "not found" and is not an error.
///
/// # Errors
///
/// Returns spawn failures and unexpected exit codes.
pub async fn which(name: &str) -> Result<Option<String>, CommandError> {
    match command_string("which", &[name]).await {
        Ok(path) if path.is_empty() => Ok(None),
        Ok(path) => Ok(Some(path)),
        Err(CommandError::Failed { code: Some(1), .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

async fn log_lines(pipe: impl AsyncRead + Unpin, is_err: bool) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_err {
            error!("{line}");
        } else {
            info!("{line}");
        }
    }
}
