//! Configuration management

use crate::tunnel::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Upstream/verification configuration loaded from the JSON config file.
///
/// ```json
/// { "Servers": ["wss://relay.example.com"], "VerifyClientCert": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Upstream tunnel URLs (`ws://host[:port]` or `wss://host[:port]`)
    #[serde(rename = "Servers", default)]
    pub servers: Vec<String>,
    /// Require and verify peer certificates on the tunnel
    #[serde(rename = "VerifyClientCert", default = "default_verify")]
    pub verify_client_cert: bool,
}

fn default_verify() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            verify_client_cert: false,
        }
    }
}

impl Config {
    /// Load configuration from file.
    ///
    /// Files ending in `.toml` are parsed as TOML, everything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
        } else {
            serde_json::from_str(&content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
        }
    }

    /// Load configuration, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => {
                info!(
                    "Loaded {} upstream server(s) from {}",
                    config.servers.len(),
                    path.as_ref().display()
                );
                config
            }
            Err(e) => {
                warn!("{}; starting without upstream servers", e);
                Self::default()
            }
        }
    }

    /// Save configuration to file as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Certificate and key locations used for the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// CA bundle used to verify peers
    pub ca: PathBuf,
    /// Server certificate chain (PEM)
    pub server_cert: PathBuf,
    /// Server private key (PEM)
    pub server_key: PathBuf,
    /// Client certificate chain presented to upstreams (PEM)
    pub client_cert: PathBuf,
    /// Client private key (PEM)
    pub client_key: PathBuf,
}

impl CertPaths {
    /// Standard file names under `dir`
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            ca: dir.join("ca.crt"),
            server_cert: dir.join("server.crt"),
            server_key: dir.join("server.key"),
            client_cert: dir.join("client.crt"),
            client_key: dir.join("client.key"),
        }
    }
}

impl Default for CertPaths {
    fn default() -> Self {
        Self::in_dir(".wsproxy/certs")
    }
}

/// Where a terminated tunnel is bridged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelBackend {
    /// Connect to the local unix-domain listener
    Unix(PathBuf),
    /// Write every received message straight back (diagnostics)
    Echo,
}

/// Process-level server options. Built once at startup, immutable afterwards.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// TCP listen address
    pub listen: String,
    /// Path of the unix-domain listener
    pub unix_socket: PathBuf,
    /// TLS material locations
    pub certs: CertPaths,
    /// Compression advertised when dialing upstreams
    pub compression: Compression,
    /// Backend for tunnels terminated on this node
    pub backend: TunnelBackend,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let unix_socket = PathBuf::from(crate::DEFAULT_UNIX_SOCKET);
        Self {
            listen: crate::DEFAULT_LISTEN_ADDR.to_string(),
            backend: TunnelBackend::Unix(unix_socket.clone()),
            unix_socket,
            certs: CertPaths::default(),
            compression: Compression::None,
        }
    }
}
