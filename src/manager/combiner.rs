//! Streams completed job outputs into the merge process.
//!
//! Three concurrent phases: feeding completed blobs into the merge process's
//! stdin in completion order, and proxying its stdout and stderr. If the merge
//! process closes its stdin early, the remaining unclaimed jobs are canceled
//! and every blob that still arrives is deleted unread.

use std::process::Stdio;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MergeConfig;
use crate::error::{Result, SharddistError};
use crate::jobs::JobSubmissionQueue;
use crate::process::{copy_split, proxy, CopyError};
use crate::storage::SharedStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineOutcome {
    /// Every completed output was streamed
    Completed,
    /// The merge process stopped reading; the rest was canceled or discarded
    EarlyTermination,
    /// Stopped from outside, e.g. on batch timeout
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombinerReport {
    pub outcome: CombineOutcome,
    /// Outputs streamed in full
    pub streamed: usize,
    /// Completed jobs without an output blob
    pub missing: usize,
    /// Blobs deleted without being streamed
    pub discarded: usize,
    pub bytes: u64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Default)]
struct FeedReport {
    streamed: usize,
    missing: usize,
    discarded: usize,
    bytes: u64,
    early: bool,
}

pub struct ResultCombiner {
    config: MergeConfig,
    storage: SharedStorage,
    queue: JobSubmissionQueue,
}

impl ResultCombiner {
    pub fn new(config: MergeConfig, storage: SharedStorage, queue: JobSubmissionQueue) -> Self {
        Self {
            config,
            storage,
            queue,
        }
    }

    /// Merge process invocation: `program args.. filter`.
    pub fn command_args(args: &[String], filter: &str) -> Vec<String> {
        let mut cmd: Vec<String> = args.to_vec();
        cmd.push(filter.to_string());
        cmd
    }

    /// Starts the merge process and the three phases.
    pub fn start<O, E>(
        self,
        args: &[String],
        filter: &str,
        stdout: O,
        stderr: E,
    ) -> Result<CombinerHandle>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let cmd_args = Self::command_args(args, filter);
        tracing::info!(
            program = %self.config.program.display(),
            args = ?cmd_args,
            "Starting combiner"
        );
        let mut child = Command::new(&self.config.program)
            .args(&cmd_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let missing = |what: &str| SharddistError::Internal(format!("merge {} not captured", what));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let child_out = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let child_err = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let buf_size = self.config.buf_size;
        let out_task = tokio::spawn(proxy(child_out, stdout, buf_size));
        let err_task = tokio::spawn(proxy(child_err, stderr, buf_size));

        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            let feed = feed(&self.queue, &self.storage, stdin, buf_size);
            let fed = tokio::select! {
                report = feed => Some(report),
                _ = token.cancelled() => None,
            };

            let status = match fed {
                Some(_) => tokio::select! {
                    status = child.wait() => Some(status),
                    _ = token.cancelled() => None,
                },
                None => None,
            };
            let status = match status {
                Some(status) => Some(status?),
                None => {
                    tracing::warn!("Combiner stopped, killing merge process");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill merge process");
                    }
                    None
                }
            };

            for proxy_task in [out_task, err_task] {
                // A killed merge process may leave children holding its pipes
                if status.is_none() {
                    proxy_task.abort();
                    continue;
                }
                match proxy_task.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Output proxy failed"),
                    Err(e) => tracing::warn!(error = %e, "Output proxy panicked"),
                }
            }

            let fed = fed.unwrap_or_default();
            let outcome = match (&status, fed.early) {
                (None, _) => CombineOutcome::Stopped,
                (Some(_), true) => CombineOutcome::EarlyTermination,
                (Some(_), false) => CombineOutcome::Completed,
            };
            let report = CombinerReport {
                outcome,
                streamed: fed.streamed,
                missing: fed.missing,
                discarded: fed.discarded,
                bytes: fed.bytes,
                exit_code: status.and_then(|s| s.code()),
            };
            tracing::info!(
                outcome = ?report.outcome,
                streamed = report.streamed,
                missing = report.missing,
                discarded = report.discarded,
                bytes = report.bytes,
                "Combiner finished"
            );
            Ok(report)
        });

        Ok(CombinerHandle { stop, task })
    }
}

/// Feeds completed outputs into the merge process until the queue is
/// exhausted or the process stops reading.
async fn feed(
    queue: &JobSubmissionQueue,
    storage: &SharedStorage,
    mut stdin: ChildStdin,
    buf_size: usize,
) -> FeedReport {
    let mut report = FeedReport::default();
    while let Some(id) = queue.take_completed().await {
        let mut blob = match storage.open(&id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                tracing::debug!(job_id = %id, "Job has no data");
                report.missing += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Cannot open job output");
                report.missing += 1;
                continue;
            }
        };

        tracing::debug!(job_id = %id, "Streaming job output");
        let copied = copy_split(&mut blob, &mut stdin, buf_size).await;
        drop(blob);
        match copied {
            Ok(bytes) => {
                report.streamed += 1;
                report.bytes += bytes;
                remove_blob(storage, &id).await;
            }
            Err(CopyError::Read(e)) => {
                tracing::warn!(job_id = %id, error = %e, "Failed to read job output, skipping");
                if remove_blob(storage, &id).await {
                    report.discarded += 1;
                }
            }
            Err(CopyError::Write(e)) => {
                tracing::info!(job_id = %id, error = %e, "Merge process closed its input, finishing early");
                report.early = true;
                if remove_blob(storage, &id).await {
                    report.discarded += 1;
                }

                if let Err(e) = queue.cancel_all().await {
                    tracing::error!(error = %e, "Failed to cancel remaining jobs");
                }
                while let Some(id) = queue.take_completed().await {
                    if remove_blob(storage, &id).await {
                        tracing::debug!(job_id = %id, "Discarded output after early finish");
                        report.discarded += 1;
                    }
                }
                break;
            }
        }
    }
    // Dropping stdin closes the merge process's input
    drop(stdin);
    report
}

/// Deletes a job's blob. Returns true if one was removed.
async fn remove_blob(storage: &SharedStorage, id: &str) -> bool {
    match storage.delete(id).await {
        Ok(removed) => removed,
        Err(e) => {
            tracing::warn!(job_id = %id, error = %e, "Failed to delete job output");
            false
        }
    }
}

/// Running combiner.
pub struct CombinerHandle {
    stop: CancellationToken,
    task: JoinHandle<Result<CombinerReport>>,
}

impl CombinerHandle {
    /// Kills the merge process and abandons any remaining outputs.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Waits for the combiner to finish. Safe to call again after an outer
    /// timeout dropped an earlier wait, e.g. once [`CombinerHandle::stop`] ran.
    pub async fn wait(&mut self) -> Result<CombinerReport> {
        (&mut self.task)
            .await
            .map_err(|e| SharddistError::Internal(format!("combiner task failed: {}", e)))?
    }
}

