//! wsproxy
//!
//! A protocol-sniffing proxy gateway that:
//! - Serves SOCKS5 and HTTP CONNECT on a single port
//! - Terminates TLS + WebSocket tunnels from other nodes
//! - Optionally forwards every client to a random upstream node

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wsproxy::config::{CertPaths, TunnelBackend};
use wsproxy::tunnel::Compression;
use wsproxy::{Config, ProxyAuth, Server, ServerOptions};

/// wsproxy - SOCKS5 / HTTP proxy with TLS + WebSocket tunneling
#[derive(Parser, Debug)]
#[command(name = "wsproxy")]
#[command(about = "Protocol-sniffing SOCKS5 / HTTP proxy with TLS + WebSocket tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON, or TOML with a .toml extension)
    #[arg(short, long, default_value = wsproxy::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Proxy listen address
    #[arg(short, long, default_value = wsproxy::DEFAULT_LISTEN_ADDR)]
    addr: String,

    /// Local unix-domain listener path
    #[arg(long, default_value = wsproxy::DEFAULT_UNIX_SOCKET)]
    unix_socket: PathBuf,

    /// Directory holding ca.crt, server.{crt,key} and client.{crt,key}
    #[arg(long, default_value = ".wsproxy/certs")]
    cert_dir: PathBuf,

    /// Compression requested when dialing upstreams (none, zlib)
    #[arg(long, default_value = "none")]
    encoding: Compression,

    /// Echo tunnel messages back instead of bridging to the unix listener
    #[arg(long)]
    echo: bool,

    /// Require this username for SOCKS5 and HTTP clients
    #[arg(long, requires = "password")]
    user: Option<String>,

    /// Password paired with --user
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    info!("wsproxy v{}", wsproxy::VERSION);
    if let Ok(dir) = std::env::current_dir() {
        info!("Working directory: {}", dir.display());
    }

    let config = Config::load_or_default(&args.config);

    let backend = if args.echo {
        TunnelBackend::Echo
    } else {
        TunnelBackend::Unix(args.unix_socket.clone())
    };

    let options = ServerOptions {
        listen: args.addr,
        unix_socket: args.unix_socket,
        certs: CertPaths::in_dir(&args.cert_dir),
        compression: args.encoding,
        backend,
    };

    let auth = match (args.user, args.password) {
        (Some(user), Some(password)) => ProxyAuth::static_credentials(user, password),
        _ => ProxyAuth::None,
    };

    let server = Arc::new(
        Server::bind(options, config, auth)
            .await
            .context("Failed to start server")?,
    );

    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    server.stop();
    runner.await.context("Server task panicked")??;

    Ok(())
}
