//! Dialing: URL construction and session establishment
//!
//! Builds the proxy connect URL from the configured target fields, opens
//! the WebSocket with the required headers and subprotocol, and binds a
//! [`Tunnel`] to the result. The SUCCESS handshake is consumed
//! asynchronously by the tunnel's reader loop; use
//! [`Tunnel::established`] to wait for it.

use crate::token::{TokenError, TokenSource};
use crate::transport::{self, TransportError};
use crate::tunnel::Tunnel;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Proxy endpoint host
pub const PROXY_HOST: &str = "tunnel.cloudproxy.app";

/// Proxy endpoint path
pub const PROXY_PATH: &str = "/v4/connect";

/// WebSocket subprotocol spoken over the transport
pub const PROXY_SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";

/// Default Origin header presented to the proxy
pub const PROXY_ORIGIN: &str = "bot:iap-tunneler";

/// Dial errors; no tunnel is produced when dialing fails
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("token source: {0}")]
    Token(#[from] TokenError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Target selection and transport options for one dial
///
/// Every field is optional; unset fields are omitted from the connect URL.
/// The server decides which combination of fields it requires.
#[derive(Clone, Default)]
pub struct DialOptions {
    pub zone: Option<String>,
    pub region: Option<String>,
    pub project: Option<String>,
    pub port: Option<String>,
    pub network: Option<String>,
    pub interface: Option<String>,
    pub instance: Option<String>,
    pub host: Option<String>,
    pub group: Option<String>,
    pub compress: bool,
    token_source: Option<Arc<dyn TokenSource>>,
    origin: Option<String>,
    endpoint: Option<String>,
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("zone", &self.zone)
            .field("region", &self.region)
            .field("project", &self.project)
            .field("port", &self.port)
            .field("network", &self.network)
            .field("interface", &self.interface)
            .field("instance", &self.instance)
            .field("host", &self.host)
            .field("group", &self.group)
            .field("compress", &self.compress)
            .field("token_source", &self.token_source.as_ref().map(|_| ".."))
            .field("origin", &self.origin)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Override the Origin header (used by tests).
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Override the proxy endpoint URL (used by tests and self-hosted
    /// relays); target fields are still appended as query parameters.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// The connect URL for these options.
    pub fn connect_url(&self) -> Result<String, DialError> {
        let base = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("wss://{}{}", PROXY_HOST, PROXY_PATH),
        };
        let mut url = Url::parse(&base).map_err(|e| DialError::InvalidEndpoint(e.to_string()))?;

        {
            let mut query = url.query_pairs_mut();
            for (key, value) in [
                ("zone", &self.zone),
                ("region", &self.region),
                ("project", &self.project),
                ("port", &self.port),
                ("network", &self.network),
                ("interface", &self.interface),
                ("instance", &self.instance),
                ("host", &self.host),
                ("group", &self.group),
            ] {
                if let Some(value) = value {
                    if !value.is_empty() {
                        query.append_pair(key, value);
                    }
                }
            }
        }

        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(url.into())
    }
}

/// Connect to the proxy and return a [`Tunnel`], or the dial error.
pub async fn dial(opts: &DialOptions) -> Result<Tunnel, DialError> {
    let url = opts.connect_url()?;

    // fetched exactly once per dial; a source error aborts the dial
    let authorization = match &opts.token_source {
        Some(source) => Some(source.token().await?.authorization()),
        None => None,
    };

    if opts.compress {
        debug!("transport compression requested; not negotiated by this client");
    }

    let origin = opts.origin.as_deref().unwrap_or(PROXY_ORIGIN);
    let connection =
        transport::connect(&url, origin, authorization.as_deref(), PROXY_SUBPROTOCOL).await?;

    let (reader, sink, local_addr, peer_addr) = connection.into_parts();
    Ok(Tunnel::new(reader, sink, local_addr, peer_addr))
}
