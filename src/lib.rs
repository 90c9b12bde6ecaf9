//! # wsproxy
//!
//! A protocol-sniffing proxy gateway. One listening endpoint accepts raw
//! TCP connections, peeks the first byte and dispatches to the protocol
//! the client speaks.
//!
//! ## Features
//!
//! - **SOCKS5** (RFC 1928) with username/password negotiation (RFC 1929)
//! - **HTTP CONNECT** proxy with `Proxy-Authorization: Basic`
//! - **TLS + WebSocket tunnels** between proxy nodes, with optional
//!   per-message zlib compression
//! - **Upstream forwarding**: relay the raw client stream to a randomly
//!   chosen upstream node instead of terminating locally
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Dispatcher (server)                   │
//! │     TCP + unix listeners, first-byte classification  │
//! ├──────────────┬──────────────┬───────────────────────┤
//! │    SOCKS5    │  HTTP proxy  │  Tunnel (TLS + WS)    │
//! │   (proxy)    │   (proxy)    │  (tunnel, upstream)   │
//! ├──────────────┴──────────────┴───────────────────────┤
//! │                 Relay primitive                      │
//! │        (full-duplex copy with half-close)            │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport                          │
//! │        (buffered, peekable TCP / unix streams)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod transport;
pub mod tunnel;
pub mod upstream;

pub use config::{Config, ServerOptions};
pub use proxy::{AuthHandler, ProxyAuth};
pub use server::{Protocol, Server};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default proxy listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2080";

/// Default path of the local unix-domain listener
pub const DEFAULT_UNIX_SOCKET: &str = "/tmp/wsproxy.sock";

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
