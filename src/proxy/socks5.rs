//! SOCKS5 proxy implementation (RFC 1928, RFC 1929)

use super::{Address, ProxyAuth, ProxyError};
use crate::relay::{relay, RelayReport};
use crate::transport::{connect_tcp, Endpoint};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// SOCKS5 version
pub const SOCKS_VERSION: u8 = 0x05;

/// Username/password sub-negotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
}

/// A parsed SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

/// Run the greeting, optional sub-negotiation and request phases.
///
/// Protocol violations return an error without writing a reply; the
/// method and sub-negotiation replies are written as soon as they are
/// decided.
pub async fn handshake<S>(stream: &mut S, auth: &ProxyAuth) -> Result<Request, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // |VER | NMETHODS | METHODS |
    let mut buf = [0u8; 256];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    let method = match auth {
        ProxyAuth::None => AuthMethod::NoAuth,
        ProxyAuth::Required(_) => {
            if buf[..nmethods].contains(&(AuthMethod::UsernamePassword as u8)) {
                AuthMethod::UsernamePassword
            } else {
                AuthMethod::NoAcceptable
            }
        }
    };

    // |VER | METHOD |
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
    stream.flush().await?;

    match method {
        AuthMethod::NoAcceptable => return Err(ProxyError::NoAcceptableMethod),
        AuthMethod::UsernamePassword => authenticate(stream, auth).await?,
        _ => {}
    }

    read_request(stream).await
}

/// RFC 1929 username/password sub-negotiation
async fn authenticate<S>(stream: &mut S, auth: &ProxyAuth) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(ProxyError::InvalidAuthVersion(version));
    }

    let username = read_credential(stream).await?;
    let password = read_credential(stream).await?;

    let accepted = auth.check(&username, &password);
    stream
        .write_all(&[AUTH_VERSION, if accepted { 0x00 } else { 0x01 }])
        .await?;
    stream.flush().await?;

    if !accepted {
        debug!("SOCKS5 credentials rejected for user {:?}", username);
        return Err(ProxyError::AuthenticationFailed);
    }
    Ok(())
}

async fn read_credential<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    if len == 0 {
        return Err(ProxyError::InvalidCredentialLength);
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// |VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT |
async fn read_request<S>(stream: &mut S) -> Result<Request, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(header[0]));
    }

    let command = Command::try_from(header[1])?;
    // header[2] is reserved
    let address = match AddressType::try_from(header[3])? {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(ip, stream.read_u16().await?)
        }
        AddressType::Domain => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8_lossy(&domain).into_owned();
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Ipv6(ip, stream.read_u16().await?)
        }
    };

    Ok(Request { command, address })
}

/// Serve one SOCKS5 client: handshake, dial, reply, relay.
pub async fn serve<S: Endpoint>(
    mut stream: S,
    auth: &ProxyAuth,
) -> Result<RelayReport, ProxyError> {
    let request = handshake(&mut stream, auth).await?;

    if request.command != Command::Connect {
        warn!("SOCKS5 {:?} handled as CONNECT to {}", request.command, request.address);
    }
    debug!("SOCKS5 {:?} to {}", request.command, request.address);

    let port = request.address.port();
    let target = match connect_tcp(&request.address.to_string()).await {
        Ok(target) => target,
        Err(e) => {
            let reply = make_reply(Reply::GeneralFailure, &Address::Ipv4([0; 4], port));
            stream.write_all(&reply).await?;
            stream.flush().await?;
            return Err(ProxyError::ConnectFailed {
                target: request.address.to_string(),
                source: e,
            });
        }
    };

    let bound = Address::from_ip(target.peer_addr()?.ip(), port);
    stream.write_all(&make_reply(Reply::Succeeded, &bound)).await?;
    stream.flush().await?;

    Ok(relay(stream, target).await)
}

/// |VER | REP | RSV | ATYP | BND.ADDR | BND.PORT |
pub fn make_reply(reply: Reply, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];

    match addr {
        Address::Ipv4(ip, port) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            buf.push(AddressType::Domain as u8);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_handshake(
        input: &[u8],
        auth: ProxyAuth,
    ) -> (Result<Request, ProxyError>, Vec<u8>) {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let result = handshake(&mut server, &auth).await;
        drop(server);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_no_auth_ipv4_request() {
        let input = [
            0x05, 0x01, 0x00, // greeting
            0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90, // CONNECT 127.0.0.1:8080
        ];
        let (result, written) = run_handshake(&input, ProxyAuth::None).await;
        assert_eq!(written, [0x05, 0x00]);
        assert_eq!(
            result.unwrap(),
            Request {
                command: Command::Connect,
                address: Address::Ipv4([127, 0, 0, 1], 8080),
            }
        );
    }

    #[tokio::test]
    async fn test_no_auth_offered_even_without_method_zero() {
        let input = [0x05, 0x01, 0x02, 0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        let (result, written) = run_handshake(&input, ProxyAuth::None).await;
        assert_eq!(written, [0x05, 0x00]);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_domain_and_ipv6_requests() {
        let mut input = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 11];
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&80u16.to_be_bytes());
        let (result, _) = run_handshake(&input, ProxyAuth::None).await;
        assert_eq!(result.unwrap().address, Address::Domain("example.com".into(), 80));

        let mut input = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
        input.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
        input.extend_from_slice(&443u16.to_be_bytes());
        let (result, _) = run_handshake(&input, ProxyAuth::None).await;
        assert_eq!(
            result.unwrap().address,
            Address::Ipv6(std::net::Ipv6Addr::LOCALHOST.octets(), 443)
        );
    }

    #[tokio::test]
    async fn test_bind_and_udp_are_accepted() {
        for cmd in [0x02u8, 0x03] {
            let input = [0x05, 0x01, 0x00, 0x05, cmd, 0x00, 0x01, 10, 0, 0, 1, 0, 53];
            let (result, _) = run_handshake(&input, ProxyAuth::None).await;
            assert_eq!(result.unwrap().command as u8, cmd);
        }
    }

    #[tokio::test]
    async fn test_auth_success() {
        let mut input = vec![0x05, 0x01, 0x02, 0x01, 5];
        input.extend_from_slice(b"alice");
        input.push(6);
        input.extend_from_slice(b"secret");
        input.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80]);

        let auth = ProxyAuth::static_credentials("alice", "secret");
        let (result, written) = run_handshake(&input, auth).await;
        assert_eq!(written, [0x05, 0x02, 0x01, 0x00]);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_auth_wrong_password() {
        let mut input = vec![0x05, 0x01, 0x02, 0x01, 5];
        input.extend_from_slice(b"alice");
        input.push(5);
        input.extend_from_slice(b"wrong");

        let auth = ProxyAuth::static_credentials("alice", "secret");
        let (result, written) = run_handshake(&input, auth).await;
        assert_eq!(written, [0x05, 0x02, 0x01, 0x01]);
        assert!(matches!(result, Err(ProxyError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_auth_required_but_not_offered() {
        let auth = ProxyAuth::static_credentials("alice", "secret");
        let (result, written) = run_handshake(&[0x05, 0x01, 0x00], auth).await;
        assert_eq!(written, [0x05, 0xFF]);
        assert!(matches!(result, Err(ProxyError::NoAcceptableMethod)));
    }

    #[tokio::test]
    async fn test_empty_username_rejected() {
        let auth = ProxyAuth::static_credentials("alice", "secret");
        let (result, written) = run_handshake(&[0x05, 0x01, 0x02, 0x01, 0x00], auth).await;
        assert_eq!(written, [0x05, 0x02]);
        assert!(matches!(result, Err(ProxyError::InvalidCredentialLength)));
    }

    #[tokio::test]
    async fn test_bad_version_aborts_silently() {
        let (result, written) = run_handshake(&[0x04, 0x01, 0x00], ProxyAuth::None).await;
        assert!(written.is_empty());
        assert!(matches!(result, Err(ProxyError::InvalidSocksVersion(4))));
    }

    #[tokio::test]
    async fn test_unknown_command_and_address_type() {
        let input = [0x05, 0x01, 0x00, 0x05, 0x09, 0x00, 0x01, 1, 1, 1, 1, 0, 80];
        let (result, _) = run_handshake(&input, ProxyAuth::None).await;
        assert!(matches!(result, Err(ProxyError::UnsupportedCommand(9))));

        let input = [0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x07];
        let (result, _) = run_handshake(&input, ProxyAuth::None).await;
        assert!(matches!(result, Err(ProxyError::UnsupportedAddressType(7))));
    }

    #[tokio::test]
    async fn test_truncated_request() {
        let input = [0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 127, 0];
        let (result, _) = run_handshake(&input, ProxyAuth::None).await;
        assert!(matches!(result, Err(ProxyError::Io(_))));
    }

    #[test]
    fn test_make_reply() {
        assert_eq!(
            make_reply(Reply::Succeeded, &Address::Ipv4([127, 0, 0, 1], 8080)),
            vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90]
        );
        let reply = make_reply(Reply::GeneralFailure, &Address::Domain("ab".into(), 1));
        assert_eq!(reply, vec![0x05, 0x01, 0x00, 0x03, 2, b'a', b'b', 0, 1]);
    }
}
