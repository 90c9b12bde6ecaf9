//! Upstream forwarding
//!
//! Instead of terminating a proxy protocol locally, the raw client stream
//! can be carried over a TLS + WebSocket tunnel to another node, which
//! then handles it as if the client had connected there directly.

use crate::relay::RelayReport;
use crate::transport::{connect_tcp, Endpoint};
use crate::tunnel::{bridge, websocket, Compression, MessageCodec, TrafficSnapshot, TunnelError};
use rand::seq::SliceRandom;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use url::Url;

/// Parsed upstream URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    url: String,
    host: String,
    port: u16,
}

impl UpstreamTarget {
    /// Parse `ws://host[:port]/...` or `wss://host[:port]/...`.
    ///
    /// Missing ports default to 80 for `ws` and 443 for `wss`.
    pub fn parse(url: &str) -> Result<Self, TunnelError> {
        let parsed =
            Url::parse(url).map_err(|e| TunnelError::InvalidUrl(format!("{}: {}", url, e)))?;

        let default_port = match parsed.scheme() {
            "ws" => 80,
            "wss" => 443,
            other => return Err(TunnelError::UnsupportedScheme(other.to_string())),
        };

        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TunnelError::InvalidUrl(format!("{}: missing host", url)))?
            .to_string();

        Ok(Self {
            url: url.to_string(),
            host,
            port: parsed.port().unwrap_or(default_port),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host as written in the URL (IPv6 literals keep their brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` suitable for dialing
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Name presented for SNI and certificate checks
    pub fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

/// Pick one upstream uniformly at random
pub fn choose(servers: &[String]) -> Option<&str> {
    servers.choose(&mut rand::thread_rng()).map(String::as_str)
}

/// Dials upstream nodes and carries local streams over the tunnel
#[derive(Clone)]
pub struct UpstreamDialer {
    connector: TlsConnector,
    compression: Compression,
}

impl UpstreamDialer {
    pub fn new(tls: Arc<ClientConfig>, compression: Compression) -> Self {
        Self {
            connector: TlsConnector::from(tls),
            compression,
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Open a tunnel: TCP, TLS, then the WebSocket upgrade.
    ///
    /// TLS is used for both schemes; the scheme only selects the default port.
    pub async fn dial(
        &self,
        target: &UpstreamTarget,
    ) -> Result<WebSocketStream<TlsStream<TcpStream>>, TunnelError> {
        let tcp = connect_tcp(&target.authority()).await?;

        let server_name = ServerName::try_from(target.server_name().to_string())
            .map_err(|e| TunnelError::Tls(format!("{}: {}", target.server_name(), e)))?;
        let tls = self.connector.connect(server_name, tcp).await?;
        debug!("TLS established with {}", target.authority());

        websocket::connect(tls, target.url(), self.compression).await
    }

    /// Carry `local` to the upstream at `url` until either side finishes
    pub async fn forward<L: Endpoint>(
        &self,
        local: L,
        url: &str,
    ) -> Result<(RelayReport, TrafficSnapshot), TunnelError> {
        let target = UpstreamTarget::parse(url)?;
        let ws = self.dial(&target).await?;
        info!("Forwarding through {}", target.host());

        Ok(bridge(ws, local, MessageCodec::new(self.compression)).await)
    }
}

impl std::fmt::Debug for UpstreamDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamDialer")
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}
