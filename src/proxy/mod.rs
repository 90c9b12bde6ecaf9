//! Proxy protocol engines
//!
//! Provides:
//! - SOCKS5 handshake engine (RFC 1928 / RFC 1929)
//! - HTTP proxy handshake engine (CONNECT tunnels)
//!
//! Both engines terminate the protocol locally, dial the requested
//! destination over TCP and hand both streams to the relay.

pub mod http;
pub mod socks5;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Invalid authentication version: {0}")]
    InvalidAuthVersion(u8),

    #[error("Invalid credential length")]
    InvalidCredentialLength,

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Connect to {target} failed: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Credential check injected by the embedding application.
///
/// Called concurrently from every connection; implementations must not
/// mutate shared state without their own synchronization.
pub type AuthHandler = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Authentication policy shared by the SOCKS5 and HTTP engines
#[derive(Clone, Default)]
pub enum ProxyAuth {
    /// Every client is allowed
    #[default]
    None,
    /// Clients must present credentials accepted by the handler
    Required(AuthHandler),
}

impl ProxyAuth {
    /// Require credentials checked by `handler`
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        ProxyAuth::Required(Arc::new(handler))
    }

    /// Require one fixed username/password pair
    pub fn static_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let password = password.into();
        Self::from_fn(move |user, pass| user == username && pass == password)
    }

    /// Whether clients have to authenticate
    pub fn is_required(&self) -> bool {
        matches!(self, ProxyAuth::Required(_))
    }

    /// Check a credential pair. Always passes when no handler is set.
    pub fn check(&self, username: &str, password: &str) -> bool {
        match self {
            ProxyAuth::None => true,
            ProxyAuth::Required(handler) => handler(username, password),
        }
    }
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyAuth::None => f.write_str("ProxyAuth::None"),
            ProxyAuth::Required(_) => f.write_str("ProxyAuth::Required(..)"),
        }
    }
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Address of an established socket, with an explicit port
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4.octets(), port),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Address::Ipv4(v4.octets(), port),
                None => Address::Ipv6(v6.octets(), port),
            },
        }
    }

    /// Parse `host:port`, keeping IP literals as IP variants
    pub fn parse_authority(target: &str) -> Result<Self, ProxyError> {
        let (host, port_str) = target
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::MalformedRequest(format!("missing port in {}", target)))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| ProxyError::MalformedRequest(format!("invalid port in {}", target)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ProxyError::MalformedRequest(format!("missing host in {}", target)));
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            Ok(Address::Ipv4(ip.octets(), port))
        } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Ok(Address::Ipv6(ip.octets(), port))
        } else {
            Ok(Address::Domain(host.to_string(), port))
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::from_ip(addr.ip(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_none_allows_everyone() {
        let auth = ProxyAuth::None;
        assert!(!auth.is_required());
        assert!(auth.check("", ""));
    }

    #[test]
    fn test_static_credentials() {
        let auth = ProxyAuth::static_credentials("alice", "secret");
        assert!(auth.is_required());
        assert!(auth.check("alice", "secret"));
        assert!(!auth.check("alice", "wrong"));
        assert!(!auth.check("bob", "secret"));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            Address::parse_authority("example.com:443").unwrap(),
            Address::Domain("example.com".into(), 443)
        );
        assert_eq!(
            Address::parse_authority("10.0.0.1:80").unwrap(),
            Address::Ipv4([10, 0, 0, 1], 80)
        );
        assert_eq!(
            Address::parse_authority("[::1]:8080").unwrap(),
            Address::Ipv6(Ipv6Addr::LOCALHOST.octets(), 8080)
        );
        assert!(Address::parse_authority("example.com").is_err());
        assert!(Address::parse_authority(":80").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::Ipv4([127, 0, 0, 1], 80).to_string(), "127.0.0.1:80");
        assert_eq!(
            Address::Ipv6(Ipv6Addr::LOCALHOST.octets(), 443).to_string(),
            "[::1]:443"
        );
        assert_eq!(Address::Domain("a.b".into(), 1).to_string(), "a.b:1");
    }

    #[test]
    fn test_mapped_ipv6_is_reported_as_ipv4() {
        let addr: SocketAddr = "[::ffff:127.0.0.1]:9000".parse().unwrap();
        assert_eq!(Address::from(addr), Address::Ipv4([127, 0, 0, 1], 9000));
    }
}
