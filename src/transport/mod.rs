//! Transport layer
//!
//! Provides:
//! - `BufferedEndpoint`, a peekable buffered wrapper for accepted streams
//! - the `Endpoint` bound shared by every relay participant
//! - outbound TCP dialing

mod buffered;

pub use buffered::BufferedEndpoint;

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

/// A duplex byte stream that can be moved into a relay task
pub trait Endpoint: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Endpoint for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Dial a TCP destination given as `host:port`
pub async fn connect_tcp(addr: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;

    // Disable Nagle's algorithm; relays flush after every chunk
    stream.set_nodelay(true).ok();

    trace!("Connected to {} via {:?}", addr, stream.peer_addr().ok());
    Ok(stream)
}
