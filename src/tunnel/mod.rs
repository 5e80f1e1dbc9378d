//! Tunnel layer - the framed byte-stream session through the proxy
//!
//! Provides:
//! - Frame encoding/decoding
//! - The connection-like [`Tunnel`] with its reader/writer loops
//! - Flow-control accounting with threshold-triggered acknowledgements
//! - In-process byte pipes coupling the loops to the application

mod conn;
mod frame;
mod pipe;

pub use conn::{Tunnel, TunnelReadHalf, TunnelWriteHalf};
pub use frame::{
    encode_ack, encode_data, encode_success, read_ack, read_data, read_success, read_tag,
    DecodeError,
};
pub use pipe::{pipe, PipeCloser, PipeReader, PipeWriter};

use thiserror::Error;

/// Maximum payload of a single DATA frame
pub const MAX_DATA_FRAME_SIZE: usize = 16384;

/// Unacked-byte ceiling that triggers an outbound ACK
pub const ACK_THRESHOLD: u64 = 2 * MAX_DATA_FRAME_SIZE as u64;

/// Frame tag: session established, carries the session id
pub const TAG_SUCCESS: u16 = 0x0001;

/// Frame tag: opaque payload bytes
pub const TAG_DATA: u16 = 0x0004;

/// Frame tag: total received-byte count acknowledged by the peer
pub const TAG_ACK: u16 = 0x0007;

/// Buffered bytes held per in-process pipe before backpressure
pub(crate) const PIPE_CAPACITY: usize = 4 * MAX_DATA_FRAME_SIZE;

/// Terminal tunnel errors
///
/// Cloneable (string payloads only) because the terminal error is replayed
/// to every subsequent read and write on both pipes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// Framing violation; fatal to the session
    #[error("{0}")]
    Protocol(String),

    /// The transport reported a structured close
    #[error("connection closed: code {code}, reason: {reason}")]
    Close { code: u16, reason: String },

    /// Any other transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// An armed read or write deadline expired
    #[error("operation timed out")]
    Timeout,

    /// The tunnel was shut down cleanly
    #[error("tunnel is closed")]
    Closed,
}
