//! Connection dispatcher
//!
//! Owns the TCP and unix-domain listeners. Every accepted connection is
//! wrapped in a [`BufferedEndpoint`], its first byte is peeked, and the
//! connection is handed to the matching engine:
//!
//! ```text
//! 0x05        → SOCKS5        ┐ or the upstream dialer when
//! 'G' / 'C'   → HTTP proxy    ┘ upstream servers are configured
//! 0x16        → TLS + WebSocket tunnel (TCP listener only)
//! other       → closed
//! ```

use crate::config::{Config, ServerOptions, TunnelBackend};
use crate::proxy::{http, socks5, ProxyAuth};
use crate::transport::BufferedEndpoint;
use crate::tunnel::{self, MessageCodec, TlsMaterial, TrafficSnapshot, TrafficStats};
use crate::upstream::{self, UpstreamDialer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{watch, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// First-byte classification of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks5,
    HttpProxy,
    TlsTunnel,
    Unknown,
}

impl Protocol {
    pub fn classify(first: u8) -> Self {
        match first {
            0x05 => Protocol::Socks5,
            b'G' | b'C' => Protocol::HttpProxy,
            0x16 => Protocol::TlsTunnel,
            _ => Protocol::Unknown,
        }
    }

    /// Classification for the unix listener, which has no tunnel branch
    pub fn classify_local(first: u8) -> Self {
        match Self::classify(first) {
            Protocol::TlsTunnel => Protocol::Unknown,
            other => other,
        }
    }
}

/// State shared by every connection. Immutable apart from the counters.
struct ServerContext {
    config: Config,
    options: ServerOptions,
    auth: ProxyAuth,
    acceptor: Option<TlsAcceptor>,
    dialer: Option<UpstreamDialer>,
    traffic: TrafficStats,
    next_id: AtomicU64,
}

impl ServerContext {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// The proxy gateway
pub struct Server {
    ctx: Arc<ServerContext>,
    listeners: Mutex<Option<(TcpListener, UnixListener)>>,
    local_addr: SocketAddr,
    unix_socket: PathBuf,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Load TLS material and bind both listeners.
    ///
    /// A stale socket file at the unix path is removed first. Missing TLS
    /// material only disables the features that need it.
    pub async fn bind(
        options: ServerOptions,
        config: Config,
        auth: ProxyAuth,
    ) -> crate::Result<Self> {
        let material = TlsMaterial::load(&options.certs, config.verify_client_cert);

        let acceptor = match material.server_config() {
            Ok(Some(tls)) => Some(TlsAcceptor::from(tls)),
            Ok(None) => None,
            Err(e) => {
                warn!("TLS server disabled: {}", e);
                None
            }
        };

        let dialer = if config.servers.is_empty() {
            None
        } else {
            match material.client_config() {
                Ok(tls) => Some(UpstreamDialer::new(tls, options.compression)),
                Err(e) => {
                    warn!("Upstream forwarding disabled: {}", e);
                    None
                }
            }
        };

        let tcp = TcpListener::bind(&options.listen).await?;
        let local_addr = tcp.local_addr()?;

        match std::fs::remove_file(&options.unix_socket) {
            Ok(()) => debug!("Removed stale socket {}", options.unix_socket.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let unix = UnixListener::bind(&options.unix_socket)?;

        info!("Listening on {}", local_addr);
        info!("Listening on unix:{}", options.unix_socket.display());
        if !config.servers.is_empty() {
            info!("Forwarding through {} upstream server(s)", config.servers.len());
        }
        if auth.is_required() {
            info!("Proxy authentication enabled");
        }

        let (shutdown, _) = watch::channel(false);
        let unix_socket = options.unix_socket.clone();

        Ok(Self {
            ctx: Arc::new(ServerContext {
                config,
                options,
                auth,
                acceptor,
                dialer,
                traffic: TrafficStats::default(),
                next_id: AtomicU64::new(1),
            }),
            listeners: Mutex::new(Some((tcp, unix))),
            local_addr,
            unix_socket,
            shutdown,
        })
    }

    /// Bound TCP address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn unix_socket(&self) -> &Path {
        &self.unix_socket
    }

    /// Tunnel traffic of every finished tunnel so far
    pub fn traffic(&self) -> TrafficSnapshot {
        self.ctx.traffic.snapshot()
    }

    /// Run both accept loops until [`Server::stop`] is called.
    ///
    /// In-flight connections keep running after this returns.
    pub async fn run(&self) -> crate::Result<()> {
        let (tcp, unix) = self
            .listeners
            .lock()
            .await
            .take()
            .ok_or_else(|| crate::Error::Config("server is already running".to_string()))?;

        tokio::join!(
            accept_tcp(tcp, self.ctx.clone(), self.shutdown.subscribe()),
            accept_unix(unix, self.ctx.clone(), self.shutdown.subscribe()),
        );

        if let Err(e) = std::fs::remove_file(&self.unix_socket) {
            debug!("Removing {}: {}", self.unix_socket.display(), e);
        }

        let traffic = self.traffic();
        info!(
            "Server stopped (tunnel bytes: {} plain, {} saved)",
            traffic.outbound_plain + traffic.inbound_plain,
            traffic.saved()
        );
        Ok(())
    }

    /// Ask both accept loops to exit
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Resolves once a stop has been requested, including before the call
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn accept_tcp(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let id = ctx.next_id();
                    debug!("[{}] New connection from {}", id, peer);

                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_tcp(stream, &ctx, id).await {
                            debug!("[{}] Connection error: {}", id, e);
                        }
                        debug!("[{}] Connection closed", id);
                    });
                }
                Err(e) => {
                    error!("TCP accept failed: {}", e);
                    break;
                }
            },
            _ = stopped(&mut shutdown) => {
                info!("TCP listener closed");
                break;
            }
        }
    }
}

async fn accept_unix(
    listener: UnixListener,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    let id = ctx.next_id();
                    debug!("[{}] New local connection", id);

                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_unix(stream, &ctx, id).await {
                            debug!("[{}] Connection error: {}", id, e);
                        }
                        debug!("[{}] Connection closed", id);
                    });
                }
                Err(e) => {
                    error!("Unix accept failed: {}", e);
                    break;
                }
            },
            _ = stopped(&mut shutdown) => {
                info!("Unix listener closed");
                break;
            }
        }
    }
}

async fn handle_tcp(stream: TcpStream, ctx: &ServerContext, id: u64) -> crate::Result<()> {
    stream.set_nodelay(true).ok();
    let mut endpoint = BufferedEndpoint::new(stream);
    let first = endpoint.peek(1).await?[0];

    match Protocol::classify(first) {
        protocol @ (Protocol::Socks5 | Protocol::HttpProxy) => {
            if let Some(url) = upstream::choose(&ctx.config.servers) {
                return forward(endpoint, url, ctx, id).await;
            }
            serve_local(protocol, endpoint, ctx, id).await
        }
        Protocol::TlsTunnel => terminate_tunnel(endpoint, ctx, id).await,
        Protocol::Unknown => {
            debug!("[{}] Unknown protocol (first byte {:#04x})", id, first);
            Ok(())
        }
    }
}

async fn handle_unix(stream: UnixStream, ctx: &ServerContext, id: u64) -> crate::Result<()> {
    let mut endpoint = BufferedEndpoint::new(stream);
    let first = endpoint.peek(1).await?[0];

    match Protocol::classify_local(first) {
        protocol @ (Protocol::Socks5 | Protocol::HttpProxy) => {
            serve_local(protocol, endpoint, ctx, id).await
        }
        _ => {
            debug!("[{}] Unknown local protocol (first byte {:#04x})", id, first);
            Ok(())
        }
    }
}

/// Terminate SOCKS5 or HTTP on this node
async fn serve_local<S>(
    protocol: Protocol,
    endpoint: BufferedEndpoint<S>,
    ctx: &ServerContext,
    id: u64,
) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let report = match protocol {
        Protocol::Socks5 => Some(socks5::serve(endpoint, &ctx.auth).await?),
        Protocol::HttpProxy => http::serve(endpoint, &ctx.auth).await?,
        _ => None,
    };

    if let Some(report) = report {
        debug!(
            "[{}] {:?} relay finished: {} bytes up, {} bytes down",
            id, protocol, report.a_to_b, report.b_to_a
        );
        if let Some(e) = report.first_error {
            debug!("[{}] Relay ended with: {}", id, e);
        }
    }
    Ok(())
}

/// Carry the raw client stream to a random upstream
async fn forward(
    endpoint: BufferedEndpoint<TcpStream>,
    url: &str,
    ctx: &ServerContext,
    id: u64,
) -> crate::Result<()> {
    let Some(dialer) = &ctx.dialer else {
        warn!("[{}] No upstream dialer available, dropping connection", id);
        return Ok(());
    };

    debug!(
        "[{}] Forwarding to {} (compression: {})",
        id,
        url,
        dialer.compression()
    );
    let (report, traffic) = dialer.forward(endpoint, url).await?;
    ctx.traffic.absorb(&traffic);
    debug!(
        "[{}] Upstream tunnel finished: {} bytes up, {} bytes down, {} saved",
        id,
        report.a_to_b,
        report.b_to_a,
        traffic.saved()
    );
    Ok(())
}

/// TLS + WebSocket server side, bridged to the configured backend
async fn terminate_tunnel(
    endpoint: BufferedEndpoint<TcpStream>,
    ctx: &ServerContext,
    id: u64,
) -> crate::Result<()> {
    let Some(acceptor) = &ctx.acceptor else {
        debug!("[{}] TLS not configured, closing tunnel connection", id);
        return Ok(());
    };

    let tls = acceptor.accept(endpoint).await?;
    let (ws, compression) = tunnel::websocket::accept(tls).await?;
    debug!("[{}] Tunnel accepted (compression: {})", id, compression);

    match &ctx.options.backend {
        TunnelBackend::Unix(path) => {
            let backend = UnixStream::connect(path).await?;
            let codec = MessageCodec::new(compression);
            let (report, traffic) = tunnel::bridge(ws, backend, codec).await;
            ctx.traffic.absorb(&traffic);
            debug!(
                "[{}] Tunnel finished: {} bytes in, {} bytes out",
                id, report.b_to_a, report.a_to_b
            );
        }
        TunnelBackend::Echo => {
            let messages = tunnel::echo(ws).await?;
            debug!("[{}] Echoed {} message(s)", id, messages);
        }
    }
    Ok(())
}
