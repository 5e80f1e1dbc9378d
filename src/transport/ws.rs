//! WebSocket transport using tokio-tungstenite
//!
//! Outbound wire frames are carried one-per-binary-message. Inbound binary
//! messages are exposed as a contiguous byte stream, so a wire frame may
//! span message boundaries. A close frame from the peer surfaces as an
//! `io::Error` wrapping [`WsClosed`] with the peer's code and reason.

use super::{FrameSink, TransportError, WsClosed};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer closed without a status
const NO_STATUS_RCVD: u16 = 1005;

/// An established WebSocket transport, split for the two tunnel loops
pub struct WsConnection {
    reader: WsReader,
    sink: Arc<WsSink>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl WsConnection {
    pub fn into_parts(
        self,
    ) -> (
        WsReader,
        Arc<WsSink>,
        Option<SocketAddr>,
        Option<SocketAddr>,
    ) {
        (self.reader, self.sink, self.local_addr, self.peer_addr)
    }
}

/// Open a WebSocket to `url` with the given `Origin` header, optional
/// `Authorization` header value, and requested subprotocol.
pub async fn connect(
    url: &str,
    origin: &str,
    authorization: Option<&str>,
    subprotocol: &str,
) -> Result<WsConnection, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        header::ORIGIN,
        HeaderValue::from_str(origin).map_err(|e| TransportError::Handshake(e.to_string()))?,
    );
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_str(subprotocol)
            .map_err(|e| TransportError::Handshake(e.to_string()))?,
    );
    if let Some(authorization) = authorization {
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(authorization)
                .map_err(|e| TransportError::Handshake(e.to_string()))?,
        );
    }

    let (stream, response) = connect_async(request)
        .await
        .map_err(|e| TransportError::Ws(e.to_string()))?;

    debug!(
        "websocket established: {} (status {})",
        url,
        response.status()
    );

    let socket = match stream.get_ref() {
        MaybeTlsStream::Plain(s) => Some(s),
        MaybeTlsStream::Rustls(t) => Some(t.get_ref().0),
        _ => None,
    };
    let local_addr = socket.and_then(|s| s.local_addr().ok());
    let peer_addr = socket.and_then(|s| s.peer_addr().ok());

    let (sink, source) = stream.split();

    Ok(WsConnection {
        reader: WsReader {
            source,
            current: Bytes::new(),
        },
        sink: Arc::new(WsSink {
            sink: Mutex::new(sink),
        }),
        local_addr,
        peer_addr,
    })
}

/// Inbound half: binary messages flattened into a byte stream
pub struct WsReader {
    source: SplitStream<WsStream>,
    current: Bytes,
}

impl AsyncRead for WsReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                buf.put_slice(&self.current[..n]);
                self.current.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(self.source.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    self.current = Bytes::from(data);
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (NO_STATUS_RCVD, String::new()),
                    };
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        WsClosed { code, reason },
                    )));
                }
                Some(Ok(other)) => {
                    // ping/pong are handled by tungstenite; text carries no
                    // tunnel payload
                    trace!("ignoring non-binary websocket message: {:?}", other);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()));
                }
                Some(Err(e)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::Other,
                        e.to_string(),
                    )));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Outbound half: one wire frame per binary message, shared by both loops
pub struct WsSink {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::Ws(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;

        // best-effort: the peer may already have started the close handshake
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        let _ = sink.send(close).await;

        match sink.close().await {
            Ok(())
            | Err(WsError::ConnectionClosed)
            | Err(WsError::AlreadyClosed)
            | Err(WsError::Protocol(_)) => Ok(()),
            Err(e) => Err(TransportError::Ws(e.to_string())),
        }
    }
}
