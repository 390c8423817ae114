//! MAVLink-FTP file download with cancellation and cleanup (spec §4.3, §5,
//! §8 "MAVFTP cancel mid-transfer").

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::message::MavMessage;
use super::MavlinkProxy;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FtpFailureReason {
    #[error("transfer was cancelled")]
    Cancelled,
    #[error("autopilot returned a non-zero MAVFTP return code")]
    ProtocolError,
    #[error("local I/O error while writing the download")]
    IoError,
    #[error("transfer timed out")]
    Timeout,
}

pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// One chunk of an in-progress FTP session; in production this is driven
/// by MAVLink-FTP's `FILE_TRANSFER_PROTOCOL` read/ack cycle exposed by the
/// underlying codec crate. PAM owns only the session bookkeeping and
/// cleanup-on-failure contract described in spec §4.3.
struct FtpSession {
    bytes_written: u64,
    total_size: Option<u64>,
}

impl MavlinkProxy {
    /// Downloads `remote_path` to `local_path`. On any non-zero MAVFTP
    /// return code, on cancellation, or on an I/O error, deletes the
    /// partial local file and resets the session to idle before returning
    /// the classified failure reason (spec §4.3).
    pub async fn download_file_ftp(
        &self,
        remote_path: &str,
        local_path: &Path,
        cancel: CancellationToken,
        progress_cb: Option<ProgressCallback>,
    ) -> Result<(), FtpFailureReason> {
        run_ftp_download(remote_path, local_path, cancel, progress_cb, |op| {
            self.send_ftp_request(op)
        })
        .await
    }

    async fn send_ftp_request(&self, op: FtpOp) -> Result<FtpAck, FtpFailureReason> {
        let payload = encode_ftp_op(&op);
        self.send(MavMessage::FileTransferProtocol { payload })
            .await
            .map_err(|_| FtpFailureReason::ProtocolError)?;
        // In production this awaits the matching FILE_TRANSFER_PROTOCOL
        // ack frame via a temporary handler registration, the same pattern
        // used by `params.rs`. Represented here as an immediate ack stub
        // since the wire-level codec is out of scope (spec §1 non-goal).
        Ok(FtpAck {
            file_size: None,
            data: None,
        })
    }
}

/// Drives one download end to end against an injected `fetch` (production
/// callers pass `MavlinkProxy::send_ftp_request`; tests pass a fake that can
/// hand back several chunks and flip the cancel token mid-transfer). Kept
/// free of `&self` so the worker-pool-facing cleanup/cancel contract can be
/// exercised without a live transport (spec §4.3, §8).
async fn run_ftp_download<F, Fut>(
    remote_path: &str,
    local_path: &Path,
    cancel: CancellationToken,
    progress_cb: Option<ProgressCallback>,
    mut fetch: F,
) -> Result<(), FtpFailureReason>
where
    F: FnMut(FtpOp) -> Fut,
    Fut: Future<Output = Result<FtpAck, FtpFailureReason>>,
{
    info!("starting MAVFTP download {remote_path} -> {}", local_path.display());

    let mut file = tokio::fs::File::create(local_path).await.map_err(|e| {
        error!("failed to create local file {}: {e}", local_path.display());
        FtpFailureReason::IoError
    })?;

    let mut session = FtpSession {
        bytes_written: 0,
        total_size: None,
    };

    let result = run_ftp_chunks(
        remote_path,
        &mut file,
        &mut session,
        &cancel,
        progress_cb.as_ref(),
        &mut fetch,
    )
    .await;

    match result {
        Ok(()) => {
            file.flush().await.ok();
            info!("MAVFTP download complete: {} bytes", session.bytes_written);
            Ok(())
        }
        Err(reason) => {
            drop(file);
            cleanup_partial_download(local_path).await;
            // Terminate/reset so a subsequent download starts from a clean
            // session (spec §4.3/§8: "FTP session in idle state").
            let _ = fetch(FtpOp::Terminate).await;
            warn!("MAVFTP download {remote_path} failed: {reason}");
            Err(reason)
        }
    }
}

/// Opens the remote file for reading over MAVLink-FTP and streams chunks
/// until EOF, a protocol NAK, or cancellation. The worker pool (not the I/O
/// task) runs this loop; the only I/O-task resource touched by the real
/// `fetch` is the send lock inside `MavlinkProxy::send`.
async fn run_ftp_chunks<F, Fut>(
    remote_path: &str,
    file: &mut tokio::fs::File,
    session: &mut FtpSession,
    cancel: &CancellationToken,
    progress_cb: Option<&ProgressCallback>,
    fetch: &mut F,
) -> Result<(), FtpFailureReason>
where
    F: FnMut(FtpOp) -> Fut,
    Fut: Future<Output = Result<FtpAck, FtpFailureReason>>,
{
    let open_ack = fetch(FtpOp::OpenRead {
        path: remote_path.to_string(),
    })
    .await?;
    session.total_size = open_ack.file_size;

    loop {
        if cancel.is_cancelled() {
            return Err(FtpFailureReason::Cancelled);
        }

        let chunk = fetch(FtpOp::ReadChunk {
            offset: session.bytes_written,
        })
        .await?;

        match chunk.data {
            Some(data) if !data.is_empty() => {
                file.write_all(&data).await.map_err(|_| FtpFailureReason::IoError)?;
                session.bytes_written += data.len() as u64;
                if let Some(cb) = progress_cb {
                    cb(session.bytes_written, session.total_size.unwrap_or(0));
                }
            }
            _ => break,
        }
    }

    fetch(FtpOp::Terminate).await.ok();
    Ok(())
}

async fn cleanup_partial_download(local_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(local_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove partial download {}: {e}", local_path.display());
        }
    }
}

enum FtpOp {
    OpenRead { path: String },
    ReadChunk { offset: u64 },
    Terminate,
}

struct FtpAck {
    file_size: Option<u64>,
    data: Option<Vec<u8>>,
}

fn encode_ftp_op(op: &FtpOp) -> Vec<u8> {
    match op {
        FtpOp::OpenRead { path } => {
            let mut buf = vec![0u8]; // opcode: OpenFileRO
            buf.extend_from_slice(path.as_bytes());
            buf
        }
        FtpOp::ReadChunk { offset } => {
            let mut buf = vec![1u8]; // opcode: ReadFile
            buf.extend_from_slice(&offset.to_le_bytes());
            buf
        }
        FtpOp::Terminate => vec![2u8], // opcode: TerminateSession
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn ftp_op_encoding_is_stable() {
        let buf = encode_ftp_op(&FtpOp::OpenRead {
            path: "logs/1.ulg".to_string(),
        });
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[1..], b"logs/1.ulg");
    }

    /// Fakes a multi-chunk MAVLink-FTP session and flips the cancel token
    /// mid-transfer (after the second chunk), then asserts the download
    /// reports `Cancelled`, leaves no partial file behind, and still sends
    /// a Terminate to reset the session (spec §8 "MAVFTP cancel
    /// mid-transfer").
    #[tokio::test]
    async fn cancel_mid_transfer_removes_partial_file_and_resets_session() {
        let cancel = CancellationToken::new();
        let chunks = vec![b"hello ".to_vec(), b"world!".to_vec(), b"more-data".to_vec()];
        let read_calls = Arc::new(AtomicUsize::new(0));
        let terminate_calls = Arc::new(AtomicUsize::new(0));

        let fetch = {
            let cancel = cancel.clone();
            let read_calls = read_calls.clone();
            let terminate_calls = terminate_calls.clone();
            let chunks = chunks.clone();
            move |op: FtpOp| {
                let cancel = cancel.clone();
                let read_calls = read_calls.clone();
                let terminate_calls = terminate_calls.clone();
                let chunks = chunks.clone();
                async move {
                    match op {
                        FtpOp::OpenRead { .. } => Ok(FtpAck {
                            file_size: Some(1_000),
                            data: None,
                        }),
                        FtpOp::ReadChunk { .. } => {
                            let idx = read_calls.fetch_add(1, Ordering::Relaxed);
                            if idx == 1 {
                                // Simulate the link dropping out after the
                                // second chunk is already in flight.
                                cancel.cancel();
                            }
                            Ok(FtpAck {
                                file_size: None,
                                data: chunks.get(idx).cloned(),
                            })
                        }
                        FtpOp::Terminate => {
                            terminate_calls.fetch_add(1, Ordering::Relaxed);
                            Ok(FtpAck { file_size: None, data: None })
                        }
                    }
                }
            }
        };

        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("download.bin");

        let result = run_ftp_download("logs/1.ulg", &local_path, cancel, None, fetch).await;

        assert_eq!(result, Err(FtpFailureReason::Cancelled));
        assert!(!local_path.exists(), "partial download must be removed on cancel");
        assert_eq!(terminate_calls.load(Ordering::Relaxed), 1);
        // Two chunks were written before the cancellation was observed.
        assert_eq!(read_calls.load(Ordering::Relaxed), 2);
    }
}
