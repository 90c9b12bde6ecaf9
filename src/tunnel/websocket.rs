//! WebSocket upgrade on both ends of a tunnel

use super::{Compression, TunnelError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::CONTENT_ENCODING;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Accept an upgrade and report the compression the client asked for
pub async fn accept<S>(stream: S) -> Result<(WebSocketStream<S>, Compression), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut compression = Compression::None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = request
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
        {
            compression = Compression::from_header(value);
        }
        debug!("WebSocket upgrade for {}", request.uri());
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    Ok((ws, compression))
}

/// Run the client upgrade for `url` over an established stream
pub async fn connect<S>(
    stream: S,
    url: &str,
    compression: Compression,
) -> Result<WebSocketStream<S>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = url.into_client_request()?;
    if let Some(value) = compression.header_value() {
        request
            .headers_mut()
            .insert(CONTENT_ENCODING, HeaderValue::from_static(value));
    }

    let (ws, response) = tokio_tungstenite::client_async(request, stream).await?;
    debug!("WebSocket upgrade to {} answered {}", url, response.status());
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake_pair(compression: Compression) -> Compression {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (accepted, connected) = tokio::join!(
            accept(server),
            connect(client, "ws://localhost/tunnel", compression)
        );
        connected.unwrap();
        accepted.unwrap().1
    }

    #[tokio::test]
    async fn test_compression_is_negotiated() {
        assert_eq!(handshake_pair(Compression::Zlib).await, Compression::Zlib);
        assert_eq!(handshake_pair(Compression::None).await, Compression::None);
    }

    #[tokio::test]
    async fn test_non_websocket_request_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert!(accept(server).await.is_err());
    }
}
