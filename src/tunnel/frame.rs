//! Frame encoding/decoding for the tunnel sub-protocol
//!
//! Frame formats (all integers big-endian):
//! ```text
//! SUCCESS : u16 = 0x0001 | u32 len | len bytes of session id
//! DATA    : u16 = 0x0004 | u32 len | len payload bytes
//! ACK     : u16 = 0x0007 | u64 total received bytes
//! ```
//!
//! Decoders consume exactly the declared payload length and never read
//! past the end of a frame. A declared length above
//! [`MAX_DATA_FRAME_SIZE`] is a fatal protocol error.

use super::pipe::PipeWriter;
use super::{TunnelError, MAX_DATA_FRAME_SIZE, TAG_ACK, TAG_DATA, TAG_SUCCESS};
use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Errors surfaced while decoding frames from the transport
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Framing violation
    #[error("{0}")]
    Protocol(String),

    /// Transport read failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The receive pipe already carries a terminal error
    #[error(transparent)]
    Pipe(TunnelError),
}

/// Encode a DATA frame. The caller keeps `payload` within the frame bound.
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_DATA_FRAME_SIZE);
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.put_u16(TAG_DATA);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf
}

/// Encode an ACK frame carrying the total received-byte count.
pub fn encode_ack(total: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.put_u16(TAG_ACK);
    buf.put_u64(total);
    buf
}

/// Encode a SUCCESS frame carrying a session id.
pub fn encode_success(session_id: &[u8]) -> Vec<u8> {
    debug_assert!(session_id.len() <= MAX_DATA_FRAME_SIZE);
    let mut buf = Vec::with_capacity(6 + session_id.len());
    buf.put_u16(TAG_SUCCESS);
    buf.put_u32(session_id.len() as u32);
    buf.extend_from_slice(session_id);
    buf
}

/// Read the 2-byte frame tag.
pub async fn read_tag<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, DecodeError> {
    let mut tag = [0u8; 2];
    r.read_exact(&mut tag).await?;
    Ok(u16::from_be_bytes(tag))
}

/// Read a bounds-checked 4-byte payload length.
async fn read_len<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize, DecodeError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;

    if len > MAX_DATA_FRAME_SIZE {
        return Err(DecodeError::Protocol(
            "len exceeds subprotocol max data frame size".to_string(),
        ));
    }

    Ok(len)
}

/// Read a SUCCESS frame body (tag already consumed); returns the session id.
pub async fn read_success<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, DecodeError> {
    let len = read_len(r).await?;

    let mut session_id = vec![0u8; len];
    r.read_exact(&mut session_id).await?;
    Ok(session_id)
}

/// Read a DATA frame body (tag already consumed), streaming the payload into
/// `sink` through `scratch`. Returns the payload length.
pub async fn read_data<R: AsyncRead + Unpin>(
    r: &mut R,
    scratch: &mut [u8],
    sink: &mut PipeWriter,
) -> Result<u64, DecodeError> {
    let len = read_len(r).await?;

    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(scratch.len());
        r.read_exact(&mut scratch[..n]).await?;
        sink.write_all(&scratch[..n]).await.map_err(DecodeError::Pipe)?;
        remaining -= n;
    }

    Ok(len as u64)
}

/// Read an ACK frame body (tag already consumed); returns the counter.
pub async fn read_ack<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, DecodeError> {
    let mut count = [0u8; 8];
    r.read_exact(&mut count).await?;
    Ok(u64::from_be_bytes(count))
}
