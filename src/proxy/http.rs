//! HTTP proxy implementation
//!
//! `CONNECT` requests open a raw tunnel to the request-URI authority.
//! Any other method gets a bare `200 OK` and the connection ends.

use super::{Address, ProxyAuth, ProxyError};
use crate::relay::{relay, RelayReport};
use crate::transport::{connect_tcp, Endpoint};
use base64::Engine as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound for the request line plus headers
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

const SERVER_NAME: &str = "nginx/1.19.0";

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Request line and headers of an HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Credentials from `Proxy-Authorization: Basic ...`
    pub fn proxy_credentials(&self) -> Option<(String, String)> {
        self.header("Proxy-Authorization").and_then(parse_basic_auth)
    }

    /// Protocol version to answer with
    fn response_version(&self) -> &str {
        if self.version.starts_with("HTTP/") {
            &self.version
        } else {
            "HTTP/1.1"
        }
    }
}

/// Read the request line and header block.
pub async fn read_request<R>(reader: &mut R) -> Result<RequestHead, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = (&mut *reader).take(MAX_HEADER_BYTES as u64);

    let mut request_line = String::new();
    read_header_line(&mut limited, &mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => (method, target, version),
        _ => {
            return Err(ProxyError::MalformedRequest(format!(
                "invalid request line {:?}",
                request_line.trim_end()
            )))
        }
    };

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        read_header_line(&mut limited, &mut line).await?;
        let line = line.trim_end();

        if line.is_empty() {
            break;
        }

        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

async fn read_header_line<R>(reader: &mut R, line: &mut String) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    reader.read_line(line).await?;
    if !line.ends_with('\n') {
        return Err(ProxyError::MalformedRequest(
            "header block truncated or too large".to_string(),
        ));
    }
    Ok(())
}

/// Decode a `Basic` credential. The scheme is matched case-insensitively.
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    const PREFIX: &str = "Basic ";

    let scheme = value.get(..PREFIX.len())?;
    if !scheme.eq_ignore_ascii_case(PREFIX) {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&value[PREFIX.len()..])
        .ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, pass) = credentials.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn respond<W>(writer: &mut W, response: &[u8]) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response).await?;
    writer.flush().await?;
    Ok(())
}

/// Run the request/authentication phase.
///
/// Returns the request-URI of an accepted `CONNECT`, `None` when the
/// request was answered with a plain `200 OK`. An accepted `CONNECT` is
/// always answered with `200 Connection established`, even when its
/// target later turns out to be unusable.
pub async fn handshake<S>(stream: &mut S, auth: &ProxyAuth) -> Result<Option<String>, ProxyError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let request = read_request(stream).await?;
    let version = request.response_version().to_string();

    if !request.method.eq_ignore_ascii_case("CONNECT") {
        debug!("HTTP {} {} answered with 200", request.method, request.target);
        let response = format!(
            "{} 200 OK\r\nServer: {}\r\nContent-Length: 0\r\n\r\n",
            version, SERVER_NAME
        );
        respond(stream, response.as_bytes()).await?;
        return Ok(None);
    }

    if auth.is_required() {
        let Some((user, pass)) = request.proxy_credentials() else {
            let response = format!(
                "{} 407 Proxy Authentication Required\r\n\
                 Proxy-Authorization: Basic realm=\"proxy\"\r\n\
                 Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
                 Content-Length: 0\r\n\r\n",
                version
            );
            respond(stream, response.as_bytes()).await?;
            return Err(ProxyError::AuthenticationRequired);
        };

        if !auth.check(&user, &pass) {
            debug!("HTTP proxy credentials rejected for user {:?}", user);
            let response = format!(
                "{} 401 Unauthorized\r\n\
                 Server: {}\r\n\
                 Proxy-Authorization: Basic realm=\"proxy\"\r\n\
                 Content-Length: 0\r\n\r\n",
                version, SERVER_NAME
            );
            respond(stream, response.as_bytes()).await?;
            return Err(ProxyError::AuthenticationFailed);
        }
    }

    respond(stream, CONNECTION_ESTABLISHED).await?;

    Ok(Some(request.target))
}

/// Serve one HTTP proxy client.
///
/// Returns `None` for non-tunnel requests, otherwise the finished relay.
pub async fn serve<S>(mut stream: S, auth: &ProxyAuth) -> Result<Option<RelayReport>, ProxyError>
where
    S: Endpoint + AsyncBufRead,
{
    let Some(target) = handshake(&mut stream, auth).await? else {
        return Ok(None);
    };

    // The client already holds a 200; a bad target just ends the connection
    let target = Address::parse_authority(&target)?;

    debug!("HTTP CONNECT to {}", target);
    let remote = connect_tcp(&target.to_string())
        .await
        .map_err(|source| ProxyError::ConnectFailed {
            target: target.to_string(),
            source,
        })?;

    Ok(Some(relay(stream, remote).await))
}
