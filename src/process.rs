//! Byte pumping between files and child processes.

use std::collections::VecDeque;
use std::io::ErrorKind;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Which side of a copy failed.
#[derive(Debug)]
pub enum CopyError {
    Read(std::io::Error),
    Write(std::io::Error),
}

impl CopyError {
    /// True if the writer's peer closed its end, e.g. a child process that
    /// stopped reading its stdin.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, CopyError::Write(e) if is_closed_pipe(e))
    }
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Read(e) => write!(f, "read failed: {}", e),
            CopyError::Write(e) => write!(f, "write failed: {}", e),
        }
    }
}

pub fn is_closed_pipe(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset)
}

/// Copies `reader` into `writer` with a `buf_size` buffer, keeping read and
/// write failures apart. Flushes the writer at the end.
pub async fn copy_split<R, W>(reader: &mut R, writer: &mut W, buf_size: usize) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(CopyError::Read)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(CopyError::Write)?;
        total += n as u64;
    }
    writer.flush().await.map_err(CopyError::Write)?;
    Ok(total)
}

/// Forwards a child's output stream to `writer` until EOF.
pub async fn proxy<R, W>(mut reader: R, mut writer: W, buf_size: usize) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match copy_split(&mut reader, &mut writer, buf_size).await {
        Ok(n) => Ok(n),
        Err(CopyError::Read(e)) | Err(CopyError::Write(e)) => Err(e),
    }
}

/// Lines of child output kept for error reports.
const TAIL_LINES: usize = 8;

/// Logs each line of a child's output stream with the job id and returns
/// the last few lines.
pub async fn log_lines<R>(reader: R, job_id: String, stream: &'static str) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(job_id = %job_id, stream, "{}", line);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(job_id = %job_id, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
    tail.into()
}
