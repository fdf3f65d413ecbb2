use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Output past `limit * OUTPUT_KILL_FACTOR` bytes kills the process group
pub(super) const OUTPUT_KILL_FACTOR: u64 = 8;

#[derive(Debug, Default)]
pub(super) struct CapturedStream {
    /// At most `limit` bytes, the head of the stream
    pub(super) bytes: Vec<u8>,
    /// Everything the child wrote, kept or not
    pub(super) total: u64,
}

impl CapturedStream {
    pub(super) fn truncated(&self) -> bool {
        self.total > self.bytes.len() as u64
    }

    pub(super) fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Reads a child's pipe to EOF, keeping the first `limit` bytes
///
/// The rest is read and discarded so the child never blocks on a full
/// pipe. `overflow` is cancelled once the child has written more than
/// [`OUTPUT_KILL_FACTOR`] times the limit.
pub(super) async fn capture<R>(
    mut reader: R,
    limit: u64,
    overflow: CancellationToken,
) -> CapturedStream
where
    R: AsyncRead + Unpin,
{
    let kill_at = limit.saturating_mul(OUTPUT_KILL_FACTOR);
    let mut captured = CapturedStream::default();
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = (limit as usize).saturating_sub(captured.bytes.len());
                captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                captured.total += n as u64;
                if captured.total > kill_at && !overflow.is_cancelled() {
                    overflow.cancel();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("Stopped reading child output: {e}");
                break;
            }
        }
    }

    captured
}
