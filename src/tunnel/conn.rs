//! The tunnel connection: two background loops around a framed transport
//!
//! A [`Tunnel`] owns the transport and two in-process pipes. The reader
//! loop decodes inbound frames into the receive pipe and tracks
//! flow-control counters; the writer loop drains the send pipe into DATA
//! frames, one application write per announcement. Either loop, on any
//! terminal condition, closes both pipes with it and exits; the
//! application observes the condition on its next read or write.

use super::frame::{self, DecodeError};
use super::pipe::{pipe, PipeCloser, PipeReader, PipeWriter};
use super::{
    TunnelError, ACK_THRESHOLD, MAX_DATA_FRAME_SIZE, PIPE_CAPACITY, TAG_ACK, TAG_DATA, TAG_SUCCESS,
};
use crate::transport::{FrameSink, WsClosed};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Session lifecycle. CLOSED is absorbing.
#[derive(Debug, Clone)]
enum Phase {
    Opening,
    Established,
    Closed(Option<TunnelError>),
}

struct Shared {
    connected: AtomicBool,
    session_id: OnceLock<String>,
    recv_acked: AtomicU64,
    send_acked: AtomicU64,
    /// Write announcements; taken exactly once by close()
    announce: Mutex<Option<mpsc::Sender<usize>>>,
    sink: Arc<dyn FrameSink>,
    phase: watch::Sender<Phase>,
    recv_closer: PipeCloser,
    send_closer: PipeCloser,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
}

impl Shared {
    /// Close both pipes with a terminal condition; first close wins.
    fn close_pipes(&self, terminal: Option<TunnelError>) {
        self.phase.send_modify(|phase| {
            if !matches!(phase, Phase::Closed(_)) {
                *phase = Phase::Closed(terminal.clone());
            }
        });
        self.recv_closer.close(terminal.clone());
        self.send_closer.close(terminal);
    }
}

/// A byte-stream connection through one proxy tunnel session
pub struct Tunnel {
    shared: Arc<Shared>,
    recv: PipeReader,
    send: PipeWriter,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel").finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Bind a tunnel to an established transport and start its loops.
    pub fn new<R>(
        transport: R,
        sink: Arc<dyn FrameSink>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (recv_writer, recv_reader) = pipe(PIPE_CAPACITY);
        let (send_writer, send_reader) = pipe(PIPE_CAPACITY);
        let (announce_tx, announce_rx) = mpsc::channel(1);
        let (phase_tx, _) = watch::channel(Phase::Opening);

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            session_id: OnceLock::new(),
            recv_acked: AtomicU64::new(0),
            send_acked: AtomicU64::new(0),
            announce: Mutex::new(Some(announce_tx)),
            sink,
            phase: phase_tx,
            recv_closer: recv_writer.closer(),
            send_closer: send_writer.closer(),
            local_addr,
            peer_addr,
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
        });

        tokio::spawn(read_loop(transport, recv_writer, shared.clone()));
        tokio::spawn(write_loop(announce_rx, send_reader, shared.clone()));

        Self {
            shared,
            recv: recv_reader,
            send: send_writer,
        }
    }

    /// Read received bytes; `Ok(0)` on clean EOF, the terminal error after
    /// a failure.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        read_op(&self.shared, &mut self.recv, buf).await
    }

    /// Send bytes through the tunnel. The whole buffer is accepted as one
    /// announcement and leaves the transport as consecutive DATA frames.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, TunnelError> {
        write_op(&self.shared, &mut self.send, buf).await
    }

    /// Shut the tunnel down. Idempotent; pending reads and writes observe
    /// the close.
    pub async fn close(&self) -> Result<(), TunnelError> {
        close_op(&self.shared).await
    }

    /// Wait until the server's SUCCESS frame has been consumed (or the
    /// tunnel failed first).
    pub async fn established(&self) -> Result<(), TunnelError> {
        let mut phase = self.shared.phase.subscribe();
        loop {
            {
                let current = phase.borrow_and_update();
                match &*current {
                    Phase::Established => return Ok(()),
                    Phase::Closed(terminal) => {
                        return Err(terminal.clone().unwrap_or(TunnelError::Closed))
                    }
                    Phase::Opening => {}
                }
            }
            if phase.changed().await.is_err() {
                return Err(TunnelError::Closed);
            }
        }
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (TunnelReadHalf, TunnelWriteHalf) {
        (
            TunnelReadHalf {
                shared: self.shared.clone(),
                recv: self.recv,
            },
            TunnelWriteHalf {
                shared: self.shared,
                send: self.send,
            },
        )
    }

    /// Whether the SUCCESS handshake has completed.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// The session id; empty until the handshake completes.
    pub fn session_id(&self) -> String {
        session_id(&self.shared)
    }

    /// Bytes sent and acknowledged by the peer.
    pub fn sent(&self) -> u64 {
        self.shared.send_acked.load(Ordering::Relaxed)
    }

    /// Bytes received and acknowledged to the peer.
    pub fn received(&self) -> u64 {
        self.shared.recv_acked.load(Ordering::Relaxed)
    }

    /// Local address of the underlying socket, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Remote address of the underlying socket, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Arm or clear the deadline for subsequent reads.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.shared.read_timeout.lock().unwrap() = timeout;
    }

    /// Arm or clear the deadline for subsequent writes.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.shared.write_timeout.lock().unwrap() = timeout;
    }

    /// Arm or clear both deadlines.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.set_read_timeout(timeout);
        self.set_write_timeout(timeout);
    }
}

/// Read half of a split [`Tunnel`]
pub struct TunnelReadHalf {
    shared: Arc<Shared>,
    recv: PipeReader,
}

impl TunnelReadHalf {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        read_op(&self.shared, &mut self.recv, buf).await
    }

    pub async fn close(&self) -> Result<(), TunnelError> {
        close_op(&self.shared).await
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> String {
        session_id(&self.shared)
    }

    pub fn received(&self) -> u64 {
        self.shared.recv_acked.load(Ordering::Relaxed)
    }
}

/// Write half of a split [`Tunnel`]
pub struct TunnelWriteHalf {
    shared: Arc<Shared>,
    send: PipeWriter,
}

impl TunnelWriteHalf {
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, TunnelError> {
        write_op(&self.shared, &mut self.send, buf).await
    }

    pub async fn close(&self) -> Result<(), TunnelError> {
        close_op(&self.shared).await
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> String {
        session_id(&self.shared)
    }

    pub fn sent(&self) -> u64 {
        self.shared.send_acked.load(Ordering::Relaxed)
    }
}

fn session_id(shared: &Shared) -> String {
    if !shared.connected.load(Ordering::Acquire) {
        return String::new();
    }
    shared.session_id.get().cloned().unwrap_or_default()
}

async fn read_op(
    shared: &Shared,
    recv: &mut PipeReader,
    buf: &mut [u8],
) -> Result<usize, TunnelError> {
    let limit = *shared.read_timeout.lock().unwrap();
    match limit {
        Some(limit) => match tokio::time::timeout(limit, recv.read(buf)).await {
            Ok(result) => result,
            Err(_) => {
                shared.close_pipes(Some(TunnelError::Timeout));
                Err(TunnelError::Timeout)
            }
        },
        None => recv.read(buf).await,
    }
}

async fn write_op(
    shared: &Shared,
    send: &mut PipeWriter,
    buf: &[u8],
) -> Result<usize, TunnelError> {
    let limit = *shared.write_timeout.lock().unwrap();
    match limit {
        Some(limit) => match tokio::time::timeout(limit, write_inner(shared, send, buf)).await {
            Ok(result) => result,
            Err(_) => {
                // the announcement may already be consumed; the tunnel is
                // no longer in a known send state
                shared.close_pipes(Some(TunnelError::Timeout));
                Err(TunnelError::Timeout)
            }
        },
        None => write_inner(shared, send, buf).await,
    }
}

async fn write_inner(
    shared: &Shared,
    send: &mut PipeWriter,
    buf: &[u8],
) -> Result<usize, TunnelError> {
    let announce = shared.announce.lock().unwrap().clone();
    let Some(announce) = announce else {
        return Err(send.terminal().unwrap_or(TunnelError::Closed));
    };

    if announce.send(buf.len()).await.is_err() {
        return Err(send.terminal().unwrap_or(TunnelError::Closed));
    }

    send.write_all(buf).await?;
    Ok(buf.len())
}

async fn close_op(shared: &Shared) -> Result<(), TunnelError> {
    // dropping the sender closes the announcement channel exactly once;
    // the writer loop then shuts both pipes down cleanly
    let _ = shared.announce.lock().unwrap().take();

    shared
        .sink
        .close()
        .await
        .map_err(|e| TunnelError::Transport(e.to_string()))
}

async fn read_loop<R>(mut transport: R, mut recv: PipeWriter, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut scratch = vec![0u8; MAX_DATA_FRAME_SIZE];
    let mut recv_unacked: u64 = 0;
    let mut recv_acked: u64 = 0;

    let terminal = loop {
        let result = read_frame(
            &mut transport,
            &mut recv,
            &mut scratch,
            &mut recv_unacked,
            &mut recv_acked,
            &shared,
        )
        .await;

        if let Err(err) = result {
            break decode_terminal(err);
        }
    };

    match &terminal {
        Some(err) => debug!("tunnel reader stopped: {}", err),
        None => trace!("tunnel reader reached end of stream"),
    }
    shared.close_pipes(terminal);
}

/// Consume one inbound frame and dispatch on its tag.
async fn read_frame<R>(
    transport: &mut R,
    recv: &mut PipeWriter,
    scratch: &mut [u8],
    recv_unacked: &mut u64,
    recv_acked: &mut u64,
    shared: &Shared,
) -> Result<(), DecodeError>
where
    R: AsyncRead + Unpin,
{
    let tag = frame::read_tag(transport).await?;

    match tag {
        TAG_SUCCESS => {
            if shared.connected.load(Ordering::Acquire) {
                return Err(DecodeError::Protocol(
                    "unexpected success frame on established session".to_string(),
                ));
            }

            let session_id = frame::read_success(transport).await?;
            let _ = shared
                .session_id
                .set(String::from_utf8_lossy(&session_id).into_owned());
            shared.connected.store(true, Ordering::Release);
            shared.phase.send_modify(|phase| {
                if matches!(phase, Phase::Opening) {
                    *phase = Phase::Established;
                }
            });
            trace!("tunnel session established");
            Ok(())
        }
        _ if !shared.connected.load(Ordering::Acquire) => Err(DecodeError::Protocol(
            "expected success frame but did not receive one".to_string(),
        )),
        TAG_DATA => {
            let n = frame::read_data(transport, scratch, recv).await?;
            *recv_unacked += n;

            if *recv_unacked - *recv_acked > ACK_THRESHOLD {
                shared
                    .sink
                    .send(frame::encode_ack(*recv_unacked))
                    .await
                    .map_err(|e| DecodeError::Io(e.into_io()))?;
                *recv_acked = *recv_unacked;
                shared.recv_acked.store(*recv_acked, Ordering::Relaxed);
            }
            Ok(())
        }
        TAG_ACK => {
            let total = frame::read_ack(transport).await?;
            shared.send_acked.store(total, Ordering::Relaxed);
            Ok(())
        }
        // unknown tags carry no payload and are ignored
        _ => Ok(()),
    }
}

async fn write_loop(
    mut announce_rx: mpsc::Receiver<usize>,
    mut send: PipeReader,
    shared: Arc<Shared>,
) {
    let terminal = loop {
        // channel closed means close() was called: clean shutdown
        let Some(n) = announce_rx.recv().await else {
            break None;
        };

        if let Err(err) = pump_frames(&mut send, &shared, n).await {
            break Some(err);
        }
    };

    match &terminal {
        Some(err) => debug!("tunnel writer stopped: {}", err),
        None => trace!("tunnel writer closed"),
    }
    shared.close_pipes(terminal);
}

/// Drain one announcement's worth of bytes into DATA frames.
async fn pump_frames(
    send: &mut PipeReader,
    shared: &Shared,
    mut n: usize,
) -> Result<(), TunnelError> {
    while n > 0 {
        let len = n.min(MAX_DATA_FRAME_SIZE);
        let mut payload = vec![0u8; len];
        send.read_exact(&mut payload).await?;

        shared
            .sink
            .send(frame::encode_data(&payload))
            .await
            .map_err(|e| io_terminal(e.into_io()).unwrap_or(TunnelError::Closed))?;
        n -= len;
    }
    Ok(())
}

fn decode_terminal(err: DecodeError) -> Option<TunnelError> {
    match err {
        DecodeError::Protocol(msg) => Some(TunnelError::Protocol(msg)),
        DecodeError::Pipe(err) => Some(err),
        DecodeError::Io(err) => io_terminal(err),
    }
}

/// Classify a transport-level failure. `None` is a clean end of stream.
fn io_terminal(err: io::Error) -> Option<TunnelError> {
    if let Some(closed) = err.get_ref().and_then(|inner| inner.downcast_ref::<WsClosed>()) {
        return Some(TunnelError::Close {
            code: closed.code,
            reason: closed.reason.clone(),
        });
    }

    if err.kind() == io::ErrorKind::UnexpectedEof {
        return None;
    }

    Some(TunnelError::Transport(err.to_string()))
}
