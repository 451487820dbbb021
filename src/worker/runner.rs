use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::File;
use tokio::process::Command;

use crate::config::ScanConfig;
use crate::jobs::ClaimedJob;
use crate::process::{copy_split, log_lines, CopyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStatus::Succeeded => write!(f, "succeeded"),
            ScanStatus::Failed => write!(f, "failed"),
            ScanStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Result of one scan process run
#[derive(Debug)]
pub struct ScanResult {
    pub job_id: String,
    pub status: ScanStatus,
    pub exit_code: Option<i32>,
    /// Bytes of the shard written to the process
    pub bytes_in: u64,
    /// The process stopped reading before the end of the shard
    pub output_limited: bool,
    /// Local file the process was told to write
    pub output: PathBuf,
    pub error: Option<String>,
}

impl ScanResult {
    pub fn succeeded(&self) -> bool {
        self.status == ScanStatus::Succeeded
    }
}

/// Runs the external scan process for a claimed job.
///
/// The process is invoked as
/// `program [extra_flags] <output_flag> <output> args.. filter`
/// with the shard piped to its stdin.
#[derive(Debug, Clone)]
pub struct ScanRunner {
    config: ScanConfig,
    local_tmp: PathBuf,
    timeout: Duration,
}

impl ScanRunner {
    pub fn new(config: ScanConfig, local_tmp: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            config,
            local_tmp: local_tmp.into(),
            timeout,
        }
    }

    pub fn local_output(&self, job_id: &str) -> PathBuf {
        self.local_tmp.join(format!("sharddist-{}.local", job_id))
    }

    pub fn command_args(&self, job: &ClaimedJob, output: &Path) -> Vec<String> {
        let mut args = self.config.extra_flags.clone();
        args.push(self.config.output_flag.clone());
        args.push(output.to_string_lossy().into_owned());
        args.extend(job.descriptor.args.iter().cloned());
        args.push(job.descriptor.filter.clone());
        args
    }

    pub async fn run(&self, job: &ClaimedJob) -> ScanResult {
        let output = self.local_output(&job.id);
        let mut result = ScanResult {
            job_id: job.id.clone(),
            status: ScanStatus::Failed,
            exit_code: None,
            bytes_in: 0,
            output_limited: false,
            output: output.clone(),
            error: None,
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.local_tmp).await {
            tracing::error!(job_id = %job.id, error = %e, "Cannot create local output directory");
            result.error = Some(e.to_string());
            return result;
        }

        let args = self.command_args(job, &output);
        tracing::info!(
            job_id = %job.id,
            program = %self.config.program.display(),
            input = %job.descriptor.input,
            "Running scan"
        );

        let spawned = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to start scan process");
                result.error = Some(e.to_string());
                return result;
            }
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(log_lines(out, job.id.clone(), "stdout")));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(log_lines(err, job.id.clone(), "stderr")));
        let stdin = child.stdin.take();
        let input = job.descriptor.input.clone();
        let buf_size = self.config.buf_size;

        let run = async {
            let fed = async move {
                let mut stdin = stdin.ok_or_else(|| {
                    CopyError::Write(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "stdin not captured",
                    ))
                })?;
                let mut file = File::open(&input).await.map_err(CopyError::Read)?;
                copy_split(&mut file, &mut stdin, buf_size).await
                // stdin dropped here so the process sees EOF
            }
            .await;
            let status = child.wait().await;
            (fed, status)
        };

        let finished = tokio::time::timeout(self.timeout, run).await;
        let (fed, status) = match finished {
            Ok(done) => done,
            Err(_) => {
                tracing::error!(job_id = %job.id, timeout_secs = self.timeout.as_secs(), "Scan timed out");
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to kill scan process");
                }
                result.status = ScanStatus::TimedOut;
                result.error = Some(format!("timed out after {:?}", self.timeout));
                return result;
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to wait for scan process");
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.exit_code = status.code();

        let feed_error = match fed {
            Ok(bytes) => {
                result.bytes_in = bytes;
                None
            }
            // The process stopped reading; fine as long as it exits cleanly
            Err(e) if e.is_broken_pipe() => {
                result.output_limited = true;
                None
            }
            Err(e) => Some(e.to_string()),
        };

        if status.success() && feed_error.is_none() {
            result.status = ScanStatus::Succeeded;
        } else {
            result.error = Some(match feed_error {
                Some(e) => e,
                None if !stderr_tail.is_empty() => stderr_tail.join("\n"),
                None => format!("Exit code: {:?}", result.exit_code),
            });
        }

        tracing::info!(
            job_id = %job.id,
            status = %result.status,
            exit_code = ?result.exit_code,
            bytes_in = result.bytes_in,
            output_limited = result.output_limited,
            "Scan finished"
        );
        result
    }
}
