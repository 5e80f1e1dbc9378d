//! iaptun client
//!
//! Starts a local TCP listener and forwards every accepted connection
//! through the identity-aware proxy tunnel.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use iaptun::config::{ClientConfig, Config};
use iaptun::dial::DialOptions;
use iaptun::proxy::Forwarder;
use iaptun::token::{CommandTokenSource, StaticTokenSource, Token, TokenSource};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// TCP forwarding over an identity-aware proxy tunnel
#[derive(Parser, Debug)]
#[command(name = "iaptun")]
#[command(about = "TCP forwarding over an identity-aware proxy tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Target zone
    #[arg(long)]
    zone: Option<String>,

    /// Target region
    #[arg(long)]
    region: Option<String>,

    /// Target project
    #[arg(long)]
    project: Option<String>,

    /// Target port
    #[arg(long)]
    port: Option<String>,

    /// Target network
    #[arg(long)]
    network: Option<String>,

    /// Target network interface
    #[arg(long)]
    interface: Option<String>,

    /// Target instance
    #[arg(long)]
    instance: Option<String>,

    /// Target host
    #[arg(long)]
    host: Option<String>,

    /// Target destination group
    #[arg(long)]
    group: Option<String>,

    /// Negotiate transport compression
    #[arg(long)]
    compress: bool,

    /// OAuth access token
    #[arg(long, env = "IAPTUN_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Token type qualifier for the Authorization header
    #[arg(long, default_value = "Bearer")]
    token_type: String,

    /// Command that prints an access token (e.g. "gcloud auth print-access-token")
    #[arg(long)]
    token_command: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    // Initialize logging; the flag overrides the config file
    let level = if args.log_level != "info" {
        args.log_level.clone()
    } else {
        config.logging.level.clone()
    };
    let subscriber = tracing_subscriber::fmt().with_env_filter(level.as_str());
    if config.logging.format == "compact" {
        subscriber.compact().init();
    } else {
        subscriber.init();
    }

    let client = config.client.unwrap_or_default();

    let listen = resolve_listen(&args, &client)?;
    let opts = resolve_dial_options(&args, &client)?;

    info!("iaptun v{}", iaptun::VERSION);

    let forwarder = Forwarder::new(listen, opts);
    forwarder.run().await.context("Listener failed")?;
    Ok(())
}

fn resolve_listen(args: &Args, client: &ClientConfig) -> Result<SocketAddr> {
    let listen = args.listen.as_deref().unwrap_or(&client.listen);
    listen
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", listen))
}

fn resolve_dial_options(args: &Args, client: &ClientConfig) -> Result<DialOptions> {
    let mut opts = client.target.dial_options();

    // Flags override config file values
    if args.zone.is_some() {
        opts.zone = args.zone.clone();
    }
    if args.region.is_some() {
        opts.region = args.region.clone();
    }
    if args.project.is_some() {
        opts.project = args.project.clone();
    }
    if args.port.is_some() {
        opts.port = args.port.clone();
    }
    if args.network.is_some() {
        opts.network = args.network.clone();
    }
    if args.interface.is_some() {
        opts.interface = args.interface.clone();
    }
    if args.instance.is_some() {
        opts.instance = args.instance.clone();
    }
    if args.host.is_some() {
        opts.host = args.host.clone();
    }
    if args.group.is_some() {
        opts.group = args.group.clone();
    }

    opts = opts.with_compress(args.compress || client.compress);

    if let Some(source) = resolve_token_source(args, client)? {
        opts = opts.with_token_source(source);
    }

    Ok(opts)
}

fn resolve_token_source(
    args: &Args,
    client: &ClientConfig,
) -> Result<Option<Arc<dyn TokenSource>>> {
    let token_type = if args.token_type != "Bearer" {
        args.token_type.clone()
    } else {
        client.token_type.clone()
    };

    let command = args.token_command.as_ref().or(client.token_command.as_ref());
    if let Some(command) = command {
        let source = CommandTokenSource::new(command, token_type)
            .map_err(|e| anyhow!("Invalid token command: {}", e))?;
        return Ok(Some(Arc::new(source)));
    }

    let token = args.access_token.as_ref().or(client.access_token.as_ref());
    if let Some(token) = token {
        let source = StaticTokenSource::new(Token::new(token, token_type));
        return Ok(Some(Arc::new(source)));
    }

    Ok(None)
}
