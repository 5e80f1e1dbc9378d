//! Integration tests for the tunnel client
//!
//! The frame-level scenarios run the real tunnel loops over an in-memory
//! duplex transport, with the test playing the proxy side of the wire.
//! The final test dials a real local WebSocket server and exercises the
//! header handshake and the structured-close path.

use futures_util::{SinkExt, StreamExt};
use iaptun::dial::{dial, DialOptions, PROXY_ORIGIN, PROXY_SUBPROTOCOL};
use iaptun::token::{StaticTokenSource, Token};
use iaptun::transport::RawSink;
use iaptun::tunnel::{encode_ack, encode_data, encode_success, Tunnel, TunnelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// A tunnel over an in-memory transport, plus the proxy side of the wire.
fn tunnel_pair() -> (Tunnel, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
    let (client_io, server_io) = duplex(1 << 20);
    let (client_read, client_write) = split(client_io);
    let tunnel = Tunnel::new(client_read, Arc::new(RawSink::new(client_write)), None, None);
    let (server_read, server_write) = split(server_io);
    (tunnel, server_read, server_write)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_handshake_then_echo() {
    let (mut tunnel, mut server_read, mut server_write) = tunnel_pair();

    server_write
        .write_all(&encode_success(b"abcd"))
        .await
        .unwrap();

    tunnel.established().await.unwrap();
    assert!(tunnel.connected());
    assert_eq!(tunnel.session_id(), "abcd");

    // proxy -> client
    server_write
        .write_all(&encode_data(b"hello"))
        .await
        .unwrap();

    let mut buf = [0u8; 32];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
    // below the ack threshold nothing has been acknowledged
    assert_eq!(tunnel.received(), 0);

    // client -> proxy
    tunnel.write(b"world").await.unwrap();

    let mut frame = [0u8; 11];
    server_read.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame[0..2], &[0x00, 0x04]);
    assert_eq!(&frame[2..6], &[0x00, 0x00, 0x00, 0x05]);
    assert_eq!(&frame[6..], b"world");
}

#[tokio::test]
async fn test_ack_threshold_fires_once() {
    let (mut tunnel, mut server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s")).await.unwrap();
    tunnel.established().await.unwrap();

    // 32769 bytes across three DATA frames crosses the 32768 threshold
    for len in [16384usize, 16384, 1] {
        server_write
            .write_all(&encode_data(&vec![0x5Au8; len]))
            .await
            .unwrap();
    }

    let mut ack = [0u8; 10];
    server_read.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack[0..2], &[0x00, 0x07]);
    assert_eq!(u64::from_be_bytes(ack[2..10].try_into().unwrap()), 32769);

    wait_until(|| tunnel.received() == 32769).await;

    // exactly one ACK was emitted
    let mut extra = [0u8; 1];
    let pending = tokio::time::timeout(Duration::from_millis(100), server_read.read(&mut extra));
    assert!(pending.await.is_err(), "unexpected extra frame from client");

    // the payload arrives intact
    let mut total = 0usize;
    let mut buf = vec![0u8; 4096];
    while total < 32769 {
        let n = tunnel.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert!(buf[..n].iter().all(|&b| b == 0x5A));
        total += n;
    }
    assert_eq!(total, 32769);
}

#[tokio::test]
async fn test_write_splits_at_frame_bound() {
    let (mut tunnel, mut server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s")).await.unwrap();
    tunnel.established().await.unwrap();

    let n = tunnel.write(&[0xAAu8; 20000]).await.unwrap();
    assert_eq!(n, 20000);

    // first frame carries a full 16384-byte payload
    let mut header = [0u8; 6];
    server_read.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[0..2], &[0x00, 0x04]);
    assert_eq!(u32::from_be_bytes(header[2..6].try_into().unwrap()), 16384);
    let mut payload = vec![0u8; 16384];
    server_read.read_exact(&mut payload).await.unwrap();
    assert!(payload.iter().all(|&b| b == 0xAA));

    // second frame carries the remaining 3616 bytes
    server_read.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[0..2], &[0x00, 0x04]);
    assert_eq!(u32::from_be_bytes(header[2..6].try_into().unwrap()), 3616);
    let mut rest = vec![0u8; 3616];
    server_read.read_exact(&mut rest).await.unwrap();
    assert!(rest.iter().all(|&b| b == 0xAA));
}

#[tokio::test]
async fn test_zero_length_writes_emit_no_frames() {
    let (mut tunnel, mut server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s")).await.unwrap();
    tunnel.established().await.unwrap();

    assert_eq!(tunnel.write(&[]).await.unwrap(), 0);
    tunnel.write(b"ok").await.unwrap();

    // only the two-byte frame shows up on the wire
    let mut frame = [0u8; 8];
    server_read.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame[0..2], &[0x00, 0x04]);
    assert_eq!(u32::from_be_bytes(frame[2..6].try_into().unwrap()), 2);
    assert_eq!(&frame[6..8], b"ok");
}

#[tokio::test]
async fn test_oversize_length_is_fatal() {
    let (mut tunnel, _server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s")).await.unwrap();
    tunnel.established().await.unwrap();

    // declared DATA length 16385
    server_write
        .write_all(&[0x00, 0x04, 0x00, 0x00, 0x40, 0x01])
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let err = tunnel.read(&mut buf).await.unwrap_err();
    assert_eq!(
        err,
        TunnelError::Protocol("len exceeds subprotocol max data frame size".to_string())
    );

    // the write path observes the same terminal error
    let err = tunnel.write(b"x").await.unwrap_err();
    assert_eq!(
        err,
        TunnelError::Protocol("len exceeds subprotocol max data frame size".to_string())
    );
}

#[tokio::test]
async fn test_data_before_success_is_fatal() {
    let (mut tunnel, _server_read, mut server_write) = tunnel_pair();

    server_write
        .write_all(&encode_data(b"premature"))
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let err = tunnel.read(&mut buf).await.unwrap_err();
    assert_eq!(
        err,
        TunnelError::Protocol("expected success frame but did not receive one".to_string())
    );
}

#[tokio::test]
async fn test_ack_before_success_is_fatal() {
    let (mut tunnel, _server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_ack(10)).await.unwrap();

    let mut buf = [0u8; 8];
    let err = tunnel.read(&mut buf).await.unwrap_err();
    assert_eq!(
        err,
        TunnelError::Protocol("expected success frame but did not receive one".to_string())
    );
}

#[tokio::test]
async fn test_duplicate_success_is_fatal() {
    let (mut tunnel, _server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s1")).await.unwrap();
    tunnel.established().await.unwrap();

    server_write.write_all(&encode_success(b"s2")).await.unwrap();

    let mut buf = [0u8; 8];
    let err = tunnel.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, TunnelError::Protocol(_)));
    // the original session id is retained
    assert_eq!(tunnel.session_id(), "s1");
}

#[tokio::test]
async fn test_inbound_ack_updates_sent_counter() {
    let (tunnel, _server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s")).await.unwrap();
    tunnel.established().await.unwrap();

    server_write.write_all(&encode_ack(4242)).await.unwrap();
    wait_until(|| tunnel.sent() == 4242).await;
}

#[tokio::test]
async fn test_unknown_tags_are_ignored() {
    let (mut tunnel, _server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s")).await.unwrap();
    tunnel.established().await.unwrap();

    // tag 0x0009 is undefined and tag-only; the stream continues
    server_write.write_all(&[0x00, 0x09]).await.unwrap();
    server_write.write_all(&encode_data(b"after")).await.unwrap();

    let mut buf = [0u8; 16];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"after");
}

#[tokio::test]
async fn test_close_makes_reads_eof_and_writes_fail() {
    let (mut tunnel, _server_read, mut server_write) = tunnel_pair();

    server_write.write_all(&encode_success(b"s")).await.unwrap();
    tunnel.established().await.unwrap();

    tunnel.close().await.unwrap();
    tunnel.close().await.unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(tunnel.read(&mut buf).await.unwrap(), 0);
    assert!(tunnel.write(b"late").await.is_err());
}

#[tokio::test]
async fn test_split_halves_share_the_session() {
    let (tunnel, mut server_read, mut server_write) = tunnel_pair();

    server_write
        .write_all(&encode_success(b"split"))
        .await
        .unwrap();
    tunnel.established().await.unwrap();

    let (mut read_half, mut write_half) = tunnel.into_split();
    assert_eq!(read_half.session_id(), "split");
    assert_eq!(write_half.session_id(), "split");

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        let n = read_half.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    });

    write_half.write(b"up").await.unwrap();
    let mut frame = [0u8; 8];
    server_read.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame[6..8], b"up");

    server_write.write_all(&encode_data(b"down")).await.unwrap();
    assert_eq!(reader.await.unwrap(), b"down");
}

#[tokio::test]
async fn test_dial_websocket_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (headers_tx, headers_rx) = std::sync::mpsc::channel::<(String, String, String, String)>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();

        let callback = move |req: &Request, mut resp: Response| {
            let get = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            headers_tx
                .send((
                    get("Origin"),
                    get("Authorization"),
                    get("Sec-WebSocket-Protocol"),
                    req.uri().to_string(),
                ))
                .unwrap();

            resp.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                PROXY_SUBPROTOCOL.parse().unwrap(),
            );
            Ok(resp)
        };

        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        ws.send(Message::Binary(encode_success(b"sess-1")))
            .await
            .unwrap();

        // echo the first DATA frame's payload back
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Binary(data)) = msg {
                assert_eq!(&data[0..2], &[0x00, 0x04]);
                let len = u32::from_be_bytes(data[2..6].try_into().unwrap()) as usize;
                assert_eq!(data.len(), 6 + len);
                ws.send(Message::Binary(encode_data(&data[6..])))
                    .await
                    .unwrap();
                break;
            }
        }

        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })))
        .await
        .unwrap();

        // drain until the close handshake completes
        while let Some(msg) = ws.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    let opts = DialOptions::new()
        .with_endpoint(format!("ws://{}/v4/connect", addr))
        .with_project("proj")
        .with_zone("zone-a")
        .with_token_source(Arc::new(StaticTokenSource::new(Token::bearer("secret"))));

    let mut tunnel = dial(&opts).await.unwrap();
    tunnel.established().await.unwrap();
    assert_eq!(tunnel.session_id(), "sess-1");
    assert!(tunnel.peer_addr().is_some());

    let (origin, authorization, subprotocol, uri) = headers_rx.recv().unwrap();
    assert_eq!(origin, PROXY_ORIGIN);
    assert_eq!(authorization, "Bearer secret");
    assert_eq!(subprotocol, PROXY_SUBPROTOCOL);
    assert!(uri.contains("project=proj"));
    assert!(uri.contains("zone=zone-a"));

    tunnel.write(b"ping").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    // the proxy's structured close surfaces on both paths
    let err = tunnel.read(&mut buf).await.unwrap_err();
    assert_eq!(
        err,
        TunnelError::Close {
            code: 1000,
            reason: "bye".to_string()
        }
    );
    let err = tunnel.write(b"late").await.unwrap_err();
    assert_eq!(
        err,
        TunnelError::Close {
            code: 1000,
            reason: "bye".to_string()
        }
    );

    tunnel.close().await.ok();
    server.await.unwrap();
}

#[tokio::test]
async fn test_dial_fails_when_token_source_fails() {
    use async_trait::async_trait;
    use iaptun::token::{TokenError, TokenSource};

    struct FailingSource;

    #[async_trait]
    impl TokenSource for FailingSource {
        async fn token(&self) -> Result<Token, TokenError> {
            Err(TokenError::Source("credentials unavailable".to_string()))
        }
    }

    let opts = DialOptions::new()
        .with_endpoint("ws://127.0.0.1:1/v4/connect")
        .with_token_source(Arc::new(FailingSource));

    let err = dial(&opts).await.unwrap_err();
    assert!(err.to_string().contains("credentials unavailable"));
}
