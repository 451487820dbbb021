//! Batches answered locally, without distributing jobs.
//!
//! A single-shard batch pipes the shard straight through the direct program.
//! A batch that needs no files (e.g. a filter syntax check) runs the program
//! with no input at all.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};

use crate::config::MergeConfig;
use crate::error::{Result, SharddistError};
use crate::process::{copy_split, proxy, CopyError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectReport {
    pub bytes_in: u64,
    /// The program stopped reading before the end of the shard
    pub output_limited: bool,
    /// Killed after running past the job timeout
    pub timed_out: bool,
    pub exit_code: Option<i32>,
}

impl DirectReport {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Invocation shared by both modes: `program args.. filter`.
pub fn command_args(args: &[String], filter: &str) -> Vec<String> {
    let mut cmd = args.to_vec();
    cmd.push(filter.to_string());
    cmd
}

/// Pipes `input` through the direct program, proxying its output. The
/// program is killed if it runs longer than `timeout`.
pub async fn run_direct<O, E>(
    config: &MergeConfig,
    input: &Path,
    args: &[String],
    filter: &str,
    timeout: Duration,
    stdout: O,
    stderr: E,
) -> Result<DirectReport>
where
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let mut file = File::open(input).await?;
    run_local(config, Some(&mut file), args, filter, timeout, stdout, stderr, "direct").await
}

/// Runs the direct program with no input, killing it after `timeout`.
pub async fn run_passthrough<O, E>(
    config: &MergeConfig,
    args: &[String],
    filter: &str,
    timeout: Duration,
    stdout: O,
    stderr: E,
) -> Result<DirectReport>
where
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    run_local(config, None, args, filter, timeout, stdout, stderr, "passthrough").await
}

#[allow(clippy::too_many_arguments)]
async fn run_local<O, E>(
    config: &MergeConfig,
    input: Option<&mut File>,
    args: &[String],
    filter: &str,
    timeout: Duration,
    stdout: O,
    stderr: E,
    mode: &'static str,
) -> Result<DirectReport>
where
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let cmd_args = command_args(args, filter);
    tracing::info!(
        mode,
        program = %config.program.display(),
        args = ?cmd_args,
        "Running batch locally"
    );

    let mut child = Command::new(&config.program)
        .args(&cmd_args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let missing = |what: &str| SharddistError::Internal(format!("{} not captured", what));
    let child_out = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let child_err = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    let out_task = tokio::spawn(proxy(child_out, stdout, config.buf_size));
    let err_task = tokio::spawn(proxy(child_err, stderr, config.buf_size));

    let mut report = DirectReport {
        bytes_in: 0,
        output_limited: false,
        timed_out: false,
        exit_code: None,
    };

    let driven = tokio::time::timeout(
        timeout,
        drive(&mut child, input, config.buf_size, &mut report, mode),
    )
    .await;
    match driven {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!(
                mode,
                timeout_secs = timeout.as_secs(),
                "Local program timed out, killing it"
            );
            report.timed_out = true;
            if let Err(e) = child.kill().await {
                tracing::warn!(mode, error = %e, "Failed to kill local program");
            }
        }
    }

    for task in [out_task, err_task] {
        // Children of a killed program may still hold its pipes
        if report.timed_out {
            task.abort();
            continue;
        }
        match task.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(mode, error = %e, "Output proxy failed"),
            Err(e) => tracing::warn!(mode, error = %e, "Output proxy panicked"),
        }
    }

    tracing::info!(
        mode,
        exit_code = ?report.exit_code,
        bytes_in = report.bytes_in,
        timed_out = report.timed_out,
        "Local run finished"
    );
    Ok(report)
}

/// Feeds the input, if any, and waits for the program to exit.
async fn drive(
    child: &mut Child,
    input: Option<&mut File>,
    buf_size: usize,
    report: &mut DirectReport,
    mode: &'static str,
) -> Result<()> {
    if let Some(file) = input {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SharddistError::Internal("stdin not captured".to_string()))?;
        match copy_split(file, &mut stdin, buf_size).await {
            Ok(n) => report.bytes_in = n,
            Err(e) if e.is_broken_pipe() => {
                tracing::debug!(mode, "Program stopped reading its input");
                report.output_limited = true;
            }
            Err(CopyError::Read(e)) => {
                tracing::error!(mode, error = %e, "Failed to read shard");
                return Err(e.into());
            }
            Err(CopyError::Write(e)) => return Err(e.into()),
        }
        drop(stdin);
    }

    let status = child.wait().await?;
    report.exit_code = status.code();
    Ok(())
}
