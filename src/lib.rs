//! # iaptun
//!
//! A streaming TCP tunnel client for hosts reachable only through a cloud
//! identity-aware proxy. A local TCP listener accepts client connections and
//! forwards each one over a secure WebSocket, where a small binary framing
//! sub-protocol carries opaque byte streams plus flow-control
//! acknowledgements.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Forwarder                         │
//! │        (local TCP listener, per-client splice)       │
//! ├─────────────────────────────────────────────────────┤
//! │                     Tunnel                           │
//! │  (reader/writer loops, pipes, flow-control counters) │
//! ├─────────────────────────────────────────────────────┤
//! │                     Framing                          │
//! │          (SUCCESS / DATA / ACK wire records)         │
//! ├─────────────────────────────────────────────────────┤
//! │                    Transport                         │
//! │        (WebSocket over TLS, binary messages)         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod dial;
pub mod proxy;
pub mod token;
pub mod transport;
pub mod tunnel;

pub use dial::{dial, DialOptions};
pub use tunnel::Tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dial error: {0}")]
    Dial(#[from] dial::DialError),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("token error: {0}")]
    Token(#[from] token::TokenError),

    #[error("proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("configuration error: {0}")]
    Config(String),
}
