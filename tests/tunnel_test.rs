//! End-to-end tunnel tests
//!
//! Uses the certificates under `tests/fixtures/certs` (a throwaway CA, a
//! server certificate for 127.0.0.1/localhost and a client certificate).

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use wsproxy::config::{CertPaths, TunnelBackend};
use wsproxy::tunnel::{Compression, MessageCodec, TlsMaterial};
use wsproxy::upstream::{UpstreamDialer, UpstreamTarget};
use wsproxy::{Config, ProxyAuth, Server, ServerOptions};

const TIMEOUT: Duration = Duration::from_secs(10);

fn fixture_certs() -> CertPaths {
    CertPaths::in_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/certs"))
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

struct Node {
    server: Arc<Server>,
    _dir: TempDir,
}

impl Node {
    async fn start(config: Config, compression: Compression, echo: bool) -> Self {
        Self::start_with_certs(config, compression, echo, fixture_certs()).await
    }

    async fn start_with_certs(
        config: Config,
        compression: Compression,
        echo: bool,
        certs: CertPaths,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let unix_socket = dir.path().join("wsproxy.sock");
        let backend = if echo {
            TunnelBackend::Echo
        } else {
            TunnelBackend::Unix(unix_socket.clone())
        };

        let options = ServerOptions {
            listen: "127.0.0.1:0".to_string(),
            unix_socket,
            certs,
            compression,
            backend,
        };

        let server = Arc::new(Server::bind(options, config, ProxyAuth::None).await.unwrap());
        {
            let server = server.clone();
            tokio::spawn(async move { server.run().await });
        }

        Self { server, _dir: dir }
    }

    fn url(&self) -> String {
        format!("wss://127.0.0.1:{}", self.server.local_addr().port())
    }
}

fn verifying_config() -> Config {
    Config {
        servers: Vec::new(),
        verify_client_cert: true,
    }
}

fn dialer(verify: bool, compression: Compression) -> UpstreamDialer {
    let material = TlsMaterial::load(&fixture_certs(), verify);
    UpstreamDialer::new(material.client_config().unwrap(), compression)
}

#[tokio::test]
async fn test_tunnel_echo_backend_with_compression() {
    let node = Node::start(verifying_config(), Compression::None, true).await;

    let target = UpstreamTarget::parse(&node.url()).unwrap();
    let mut ws = tokio::time::timeout(TIMEOUT, dialer(true, Compression::Zlib).dial(&target))
        .await
        .expect("dial timed out")
        .unwrap();

    let codec = MessageCodec::new(Compression::Zlib);
    for payload in [b"".to_vec(), b"small".to_vec(), vec![7u8; 100_000]] {
        ws.send(Message::Binary(codec.encode(&payload).unwrap()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let Message::Binary(reply) = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert_eq!(codec.decode(&reply).unwrap(), payload);
    }

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_client_without_certificate_is_rejected() {
    let node = Node::start(verifying_config(), Compression::None, true).await;

    // Same trust roots, but no client identity to present
    let dir = tempfile::tempdir().unwrap();
    let mut paths = CertPaths::in_dir(dir.path());
    paths.ca = fixture_certs().ca;
    let material = TlsMaterial::load(&paths, true);
    let dialer = UpstreamDialer::new(material.client_config().unwrap(), Compression::None);

    let target = UpstreamTarget::parse(&node.url()).unwrap();
    let result = tokio::time::timeout(TIMEOUT, dialer.dial(&target))
        .await
        .expect("dial timed out");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_socks5_forwarded_through_upstream() {
    let echo = spawn_echo_server().await;

    // Far node terminates the tunnel into its own unix listener
    let far = Node::start(verifying_config(), Compression::None, false).await;

    // Near node forwards every client to the far node
    let near = Node::start(
        Config {
            servers: vec![far.url()],
            verify_client_cert: true,
        },
        Compression::Zlib,
        false,
    )
    .await;

    let mut client = TcpStream::connect(near.server.local_addr()).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut method))
        .await
        .expect("greeting timed out")
        .unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let SocketAddr::V4(v4) = echo else {
        panic!("expected an IPv4 address");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);

    let payload = vec![b'z'; 200_000];
    client.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert!(echoed == payload);

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("tunnel did not close")
        .unwrap();
    assert!(rest.is_empty());
    drop(client);

    // Accounting lands once the near node's tunnel has fully finished
    let traffic = tokio::time::timeout(TIMEOUT, async {
        loop {
            let traffic = near.server.traffic();
            if traffic.outbound_plain > 0 {
                break traffic;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("traffic was never recorded");

    assert!(traffic.outbound_plain >= payload.len() as u64);
    assert!(traffic.saved() > 0);
}

#[tokio::test]
async fn test_http_connect_forwarded_without_verification() {
    let echo = spawn_echo_server().await;
    let unverified = Config {
        servers: Vec::new(),
        verify_client_cert: false,
    };

    let far = Node::start(unverified.clone(), Compression::None, false).await;

    // No CA and no client identity: only skip-verification lets the near node in
    let empty = tempfile::tempdir().unwrap();
    let near = Node::start_with_certs(
        Config {
            servers: vec![far.url()],
            ..unverified
        },
        Compression::None,
        false,
        CertPaths::in_dir(empty.path()),
    )
    .await;

    let mut client = TcpStream::connect(near.server.local_addr()).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", echo, echo);
    client.write_all(request.as_bytes()).await.unwrap();

    let established = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut head = vec![0u8; established.len()];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut head))
        .await
        .expect("CONNECT timed out")
        .unwrap();
    assert_eq!(head, established);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"ping");
}
