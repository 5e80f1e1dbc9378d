//! Local TCP forwarding through the tunnel
//!
//! Accepts TCP clients on a bind address and splices each one into a
//! freshly dialed tunnel session: bytes flow in both directions until
//! either side ends, then both sides are closed.

use crate::dial::{dial, DialOptions};
use crate::tunnel::{TunnelReadHalf, TunnelWriteHalf};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Splice buffer size per direction
const COPY_BUF_SIZE: usize = 65536;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A local TCP listener forwarding every client through the tunnel
pub struct Forwarder {
    listen: SocketAddr,
    opts: DialOptions,
}

impl Forwarder {
    pub fn new(listen: SocketAddr, opts: DialOptions) -> Self {
        Self { listen, opts }
    }

    /// Bind and serve until the listener fails. Bind errors surface to the
    /// caller; per-client errors are logged and drop only that client.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.listen).await?;
        info!("listening on {}", self.listen);

        loop {
            let (socket, peer) = listener.accept().await?;
            let opts = self.opts.clone();

            tokio::spawn(async move {
                handle_conn(opts, socket, peer).await;
            });
        }
    }
}

async fn handle_conn(opts: DialOptions, socket: TcpStream, peer: SocketAddr) {
    info!("client connected: {}", peer);

    let tunnel = match dial(&opts).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            error!("dial failed for {}: {}", peer, e);
            return;
        }
    };

    if let Err(e) = tunnel.established().await {
        error!("session establishment failed for {}: {}", peer, e);
        let _ = tunnel.close().await;
        return;
    }
    info!("established session {} for {}", tunnel.session_id(), peer);

    socket.set_nodelay(true).ok();
    let (sock_read, sock_write) = socket.into_split();
    let (tun_read, tun_write) = tunnel.into_split();

    // each direction closes the tunnel when it ends; the first to finish
    // tears the other one down
    let mut upstream = tokio::spawn(client_to_tunnel(sock_read, tun_write, peer));
    let mut downstream = tokio::spawn(tunnel_to_client(tun_read, sock_write, peer));

    tokio::select! {
        _ = &mut upstream => downstream.abort(),
        _ = &mut downstream => upstream.abort(),
    }

    info!("client disconnected: {}", peer);
}

async fn client_to_tunnel(
    mut sock_read: OwnedReadHalf,
    mut tun_write: TunnelWriteHalf,
    peer: SocketAddr,
) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        match sock_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = tun_write.write(&buf[..n]).await {
                    debug!("tunnel write ended for {}: {}", peer, e);
                    break;
                }
            }
            Err(e) => {
                debug!("client read ended for {}: {}", peer, e);
                break;
            }
        }
    }

    let _ = tun_write.close().await;
}

async fn tunnel_to_client(
    mut tun_read: TunnelReadHalf,
    mut sock_write: OwnedWriteHalf,
    peer: SocketAddr,
) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        match tun_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = sock_write.write_all(&buf[..n]).await {
                    debug!("client write ended for {}: {}", peer, e);
                    break;
                }
            }
            Err(e) => {
                debug!("tunnel read ended for {}: {}", peer, e);
                break;
            }
        }
    }

    let _ = sock_write.shutdown().await;
    let _ = tun_read.close().await;
}
