//! Length-prefixed framing shared by the stream transports (`tcp`, `tls`,
//! `unix`, and `mpath`, which is TCP underneath). QUIC frames its own
//! stream boundaries but we keep the same wire shape on top of its one
//! long-lived stream for symmetry with the other adapters.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::LinkError;

/// Largest single frame we'll allocate a buffer for. Generous relative to
/// any session MTU; guards against a misbehaving peer driving unbounded
/// allocation.
const MAX_FRAME_LEN: u32 = 1 << 20;

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), LinkError> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(LinkError::Transport(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))?;
    w.write_all(payload)
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))?;
    w.flush().await.map_err(|e| LinkError::Transport(e.to_string()))
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, LinkError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(LinkError::Protocol(format!(
            "peer announced a {len} byte frame, exceeding the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))?;
    Ok(buf)
}
