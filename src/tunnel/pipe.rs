//! Bounded in-process byte pipes with close-with-error semantics
//!
//! Each pipe is a single-producer/single-consumer byte conduit coupling one
//! tunnel loop to the application. Closing carries an optional terminal
//! error: readers drain buffered bytes first, then observe either clean EOF
//! (`Ok(0)`) or the terminal error; writers observe the terminal state
//! immediately. The first close wins; later closes are no-ops.

use super::TunnelError;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct State {
    queue: VecDeque<Bytes>,
    queued: usize,
    /// `Some(None)` = clean EOF, `Some(Some(err))` = terminal error
    terminal: Option<Option<TunnelError>>,
}

struct Shared {
    state: Mutex<State>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn close(&self, terminal: Option<TunnelError>) {
        let mut state = self.state.lock().unwrap();
        if state.terminal.is_none() {
            state.terminal = Some(terminal);
        }
        drop(state);

        self.readable.notify_one();
        self.writable.notify_one();
    }

    fn terminal(&self) -> Option<TunnelError> {
        match self.state.lock().unwrap().terminal.as_ref() {
            Some(Some(err)) => Some(err.clone()),
            Some(None) => Some(TunnelError::Closed),
            None => None,
        }
    }
}

/// Create a pipe buffering at most `capacity` bytes.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            queued: 0,
            terminal: None,
        }),
        capacity,
        readable: Notify::new(),
        writable: Notify::new(),
    });

    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader {
            shared,
            current: Bytes::new(),
        },
    )
}

/// Write end of a pipe
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Write all of `buf`, blocking on backpressure. A zero-length write
    /// returns immediately without touching the pipe.
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TunnelError> {
        while !buf.is_empty() {
            let notified = self.shared.writable.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(terminal) = &state.terminal {
                    return Err(terminal.clone().unwrap_or(TunnelError::Closed));
                }

                if state.queued < self.shared.capacity {
                    let n = (self.shared.capacity - state.queued).min(buf.len());
                    state.queue.push_back(Bytes::copy_from_slice(&buf[..n]));
                    state.queued += n;
                    buf = &buf[n..];

                    self.shared.readable.notify_one();
                    continue;
                }
            }
            notified.await;
        }
        Ok(())
    }

    /// Close the pipe; `None` reads as clean EOF.
    pub fn close(&self, terminal: Option<TunnelError>) {
        self.shared.close(terminal);
    }

    /// The terminal state, if the pipe has been closed.
    pub fn terminal(&self) -> Option<TunnelError> {
        self.shared.terminal()
    }

    /// A detached handle that can close this pipe.
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }
}

/// Read end of a pipe
pub struct PipeReader {
    shared: Arc<Shared>,
    current: Bytes,
}

impl PipeReader {
    /// Read at least one byte into `buf`, or return `Ok(0)` on clean EOF /
    /// the terminal error once buffered bytes are drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.len());
                buf[..n].copy_from_slice(&self.current[..n]);
                self.current.advance(n);
                return Ok(n);
            }

            let notified = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(chunk) = state.queue.pop_front() {
                    state.queued -= chunk.len();
                    self.current = chunk;
                    self.shared.writable.notify_one();
                    continue;
                }

                if let Some(terminal) = &state.terminal {
                    return match terminal {
                        Some(err) => Err(err.clone()),
                        None => Ok(0),
                    };
                }
            }
            notified.await;
        }
    }

    /// Read exactly `buf.len()` bytes; a close mid-read surfaces the
    /// terminal state.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TunnelError> {
        let mut off = 0;
        while off < buf.len() {
            match self.read(&mut buf[off..]).await? {
                0 => return Err(TunnelError::Closed),
                n => off += n,
            }
        }
        Ok(())
    }

    /// A detached handle that can close this pipe.
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }
}

/// Detached close handle for a pipe
#[derive(Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
}

impl PipeCloser {
    /// Close the pipe; `None` reads as clean EOF. First close wins.
    pub fn close(&self, terminal: Option<TunnelError>) {
        self.shared.close(terminal);
    }
}
