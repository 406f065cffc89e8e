//! Reads and writes over raw peer connections.
//!
//! Messages are not length-prefixed: a join request or probe is whatever the
//! first read returns, a welcome runs until the sender closes, and a heartbeat
//! reply is anything containing the response marker.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::is_heartbeat_response;

/// Largest single message accepted from a peer.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

pub async fn write_message<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the first chunk a peer sends, or `None` if it closes without sending.
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; READ_CHUNK];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf))
}

/// Read until the peer closes its side, failing past `limit` bytes.
pub async fn read_to_close<R: AsyncRead + Unpin>(stream: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut limited = stream.take(limit as u64 + 1);
    limited.read_to_end(&mut buf).await?;
    if buf.len() > limit {
        bail!("message exceeds {limit} bytes");
    }
    Ok(buf)
}

/// Read until a heartbeat response shows up (`true`) or the peer closes
/// (`false`).
pub async fn read_heartbeat_reply<R: AsyncRead + Unpin>(stream: &mut R, limit: usize) -> Result<bool> {
    let mut seen = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        seen.extend_from_slice(&chunk[..n]);
        if is_heartbeat_response(&seen) {
            return Ok(true);
        }
        if seen.len() > limit {
            bail!("heartbeat reply exceeds {limit} bytes");
        }
    }
}
