//! TLS + WebSocket tunnel between proxy nodes
//!
//! The inner byte stream travels as binary WebSocket messages over a
//! TLS 1.3 connection. Each message may be compressed independently
//! (`Content-Encoding: zlib` on the upgrade request).
//!
//! ```text
//! local stream ──chunk──▶ [zlib] ──▶ WS binary msg ──▶ TLS ──▶ peer
//! local stream ◀──────── [inflate] ◀── WS binary msg ◀── TLS ◀── peer
//! ```

mod bridge;
mod codec;
mod tls;
pub mod websocket;

pub use bridge::{bridge, echo};
pub use codec::{MessageCodec, TrafficSnapshot, TrafficStats, MAX_MESSAGE_SIZE};
pub use tls::{load_certs, load_private_key, Identity, TlsMaterial};

use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),
}

/// Per-message compression negotiated on the WebSocket upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zlib,
}

impl Compression {
    /// Interpret a `Content-Encoding` header value
    pub fn from_header(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("zlib") {
            Compression::Zlib
        } else {
            Compression::None
        }
    }

    /// `Content-Encoding` value to advertise, if any
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Zlib => Some("zlib"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            other => Err(format!("unknown encoding: {}", other)),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value().unwrap_or("none"))
    }
}

pub(crate) fn ws_to_io(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}
