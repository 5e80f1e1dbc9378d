//! Transport layer
//!
//! The tunnel rides a reliable duplex binary-message channel. The reader
//! loop consumes the inbound side as a contiguous byte stream
//! (`AsyncRead`); the outbound side is a [`FrameSink`] writing one wire
//! frame per call, shared between the writer loop (DATA frames) and the
//! reader loop (ACK frames).

mod ws;

pub use ws::{connect, WsConnection, WsReader, WsSink};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    Ws(String),

    #[error("connection closed: code {code}, reason: {reason}")]
    Closed { code: u16, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl TransportError {
    /// Flatten into an `io::Error`, keeping a structured close reachable
    /// via [`io::Error::get_ref`] downcasting.
    pub fn into_io(self) -> io::Error {
        match self {
            TransportError::Io(err) => err,
            TransportError::Closed { code, reason } => {
                io::Error::new(io::ErrorKind::ConnectionReset, WsClosed { code, reason })
            }
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Structured close carried through `io::Error` when the peer terminated
/// the transport with a close frame.
#[derive(Debug, Clone, Error)]
#[error("connection closed: code {code}, reason: {reason}")]
pub struct WsClosed {
    pub code: u16,
    pub reason: String,
}

/// Outbound side of a transport: one wire frame per send.
///
/// Implementations serialize concurrent senders internally; the tunnel's
/// writer loop and reader loop both hold a handle.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one wire frame to the transport.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close the transport. Idempotent at this layer.
    async fn close(&self) -> Result<(), TransportError>;
}

/// [`FrameSink`] over any raw byte writer; frames are simply concatenated
/// onto the stream. Used for in-memory transports in tests.
pub struct RawSink<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> RawSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for RawSink<W> {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.inner.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
