//! Length-prefixed framing for reliable byte streams.
//!
//! Wire format: `[4-byte little-endian length N][N payload bytes]`
//!
//! The two-part write is issued as a single buffer so a frame can never
//! interleave with another writer's frame; callers still serialize on the
//! per-stream write lock. A zero-byte read at either stage is an orderly
//! peer close.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DuplexError, DuplexResult};

/// Default maximum payload length (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1_048_576;

/// Write one framed payload.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max_len: u32,
) -> DuplexResult<()> {
    if payload.len() > max_len as usize {
        return Err(DuplexError::Framing(format!(
            "frame too large: {} bytes (max {max_len})",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| DuplexError::Transport(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| DuplexError::Transport(format!("flush failed: {e}")))?;
    Ok(())
}

/// Read one framed payload.
///
/// Returns `Ok(None)` on orderly peer close, an error on I/O failure or when
/// the declared length exceeds `max_len`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: u32,
) -> DuplexResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf).await? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > max_len {
        return Err(DuplexError::Framing(format!(
            "declared frame length {len} exceeds maximum {max_len}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload).await? {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Fill `buf` completely. Returns `false` if the peer closed the stream.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> DuplexResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| DuplexError::Transport(format!("read failed: {e}")))?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}
