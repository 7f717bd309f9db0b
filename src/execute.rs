//! One-shot sub-process execution, independent of any session.
//!
//! Unlike a session command this runs without a PTY: stdout and stderr are
//! captured as separate streams and decoded lossily. A timeout escalates
//! from SIGTERM to SIGKILL; the command is never retried.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command as ProcessCommand};

use crate::protocol::{Command, CommandResponse, RawCommand, EXIT_CODE_UNKNOWN};

/// How long a SIGTERM'd child gets before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    CommandFailed(String),

    #[error("i/o error while running command: {0}")]
    Io(#[from] std::io::Error),
}

fn build_command(request: &Command) -> Result<ProcessCommand, ExecuteError> {
    let mut cmd = match (&request.command, request.shell) {
        (RawCommand::Line(line), true) => {
            let mut cmd = ProcessCommand::new("/bin/sh");
            cmd.arg("-c").arg(line);
            cmd
        }
        (RawCommand::Argv(argv), true) => {
            let line = argv.first().ok_or(ExecuteError::EmptyCommand)?;
            let mut cmd = ProcessCommand::new("/bin/sh");
            cmd.arg("-c").arg(line);
            // Remaining elements become $0, $1, ... inside the command line.
            cmd.args(&argv[1..]);
            cmd
        }
        (RawCommand::Line(line), false) => {
            if line.is_empty() {
                return Err(ExecuteError::EmptyCommand);
            }
            ProcessCommand::new(line)
        }
        (RawCommand::Argv(argv), false) => {
            let program = argv.first().ok_or(ExecuteError::EmptyCommand)?;
            let mut cmd = ProcessCommand::new(program);
            cmd.args(&argv[1..]);
            cmd
        }
    };

    if let Some(cwd) = &request.cwd {
        cmd.current_dir(cwd);
    }
    if request.replace_env {
        cmd.env_clear();
    }
    if let Some(env) = &request.env {
        cmd.envs(env);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

/// SIGTERM, bounded wait, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if pid <= i32::MAX as u32 {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        tracing::debug!("child ignored SIGTERM, sending SIGKILL");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Run a one-shot command to completion (or timeout) with captured streams.
pub async fn execute(request: &Command) -> Result<CommandResponse, ExecuteError> {
    let mut cmd = build_command(request)?;
    let mut child = cmd.spawn().map_err(|source| ExecuteError::Spawn {
        command: request.command.display(),
        source,
    })?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let timeout = request.timeout.filter(|t| *t > 0.0);
    let status = match timeout {
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs_f64(secs), child.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => {
                    tracing::debug!(command = %request.command.display(), "one-shot command timed out");
                    terminate(&mut child).await;
                    None
                }
            }
        }
        None => Some(child.wait().await?),
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    let response = match status {
        Some(status) => CommandResponse {
            stdout,
            stderr,
            exit_code: status.code().map(i64::from).unwrap_or(EXIT_CODE_UNKNOWN),
            failure_reason: String::new(),
        },
        None => CommandResponse {
            stdout,
            stderr,
            exit_code: EXIT_CODE_UNKNOWN,
            failure_reason: "timeout".to_string(),
        },
    };

    if request.check && response.failure_reason.is_empty() && response.exit_code != 0 {
        let mut msg = format!(
            "Command {:?} failed with exit code {}. Stdout:\n{}\nStderr:\n{}",
            request.command.display(),
            response.exit_code,
            response.stdout,
            response.stderr
        );
        if !request.error_msg.is_empty() {
            msg = format!("{}: {}", request.error_msg, msg);
        }
        return Err(ExecuteError::CommandFailed(msg));
    }

    Ok(response)
}
