//! Pump bytes between a local stream and a WebSocket tunnel

use super::{ws_to_io, MessageCodec, TrafficSnapshot, TrafficStats, TunnelError};
use crate::relay::{Completion, Direction, RelayReport, RELAY_CHUNK_SIZE};
use crate::transport::Endpoint;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Bridge `local` and `ws` until both directions finish.
///
/// Local → tunnel is [`Direction::AToB`]. Local EOF is forwarded as a
/// Close frame; a Close (or EOF) from the tunnel shuts down the local
/// write half and stops the outbound side, which flushes the Close reply.
pub async fn bridge<S, L>(
    ws: WebSocketStream<S>,
    local: L,
    codec: MessageCodec,
) -> (RelayReport, TrafficSnapshot)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    L: Endpoint,
{
    let stats = Arc::new(TrafficStats::default());
    let (mut sink, mut stream) = ws.split();
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(2);
    let peer_closed = Arc::new(Notify::new());

    let outbound = {
        let stats = stats.clone();
        let done_tx = done_tx.clone();
        let peer_closed = peer_closed.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
            let mut total = 0u64;

            let error = loop {
                let read = tokio::select! {
                    read = local_read.read(&mut buf) => read,
                    _ = peer_closed.notified() => {
                        trace!("Peer closed the tunnel, stop reading local");
                        break None;
                    }
                };
                let n = match read {
                    Ok(0) => break None,
                    Ok(n) => n,
                    Err(e) => break Some(e),
                };
                let payload = match codec.encode(&buf[..n]) {
                    Ok(payload) => payload,
                    Err(e) => break Some(e),
                };
                let wire = payload.len();
                if let Err(e) = sink.send(Message::Binary(payload)).await {
                    break Some(ws_to_io(e));
                }
                stats.record_outbound(n, wire);
                total += n as u64;
            };

            if let Err(e) = sink.close().await {
                trace!("Closing tunnel sink: {}", e);
            }

            let _ = done_tx
                .send(Completion {
                    direction: Direction::AToB,
                    bytes: total,
                    error,
                })
                .await;
        })
    };

    let inbound = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut total = 0u64;

            let error = loop {
                let payload = match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => {
                        peer_closed.notify_one();
                        break None;
                    }
                    Some(Err(e)) => break Some(ws_to_io(e)),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(_)) => continue,
                };
                let plain = match codec.decode(&payload) {
                    Ok(plain) => plain,
                    Err(e) => break Some(e),
                };
                if let Err(e) = local_write.write_all(&plain).await {
                    break Some(e);
                }
                if let Err(e) = local_write.flush().await {
                    break Some(e);
                }
                stats.record_inbound(plain.len(), payload.len());
                total += plain.len() as u64;
            };

            let _ = local_write.shutdown().await;

            let _ = done_tx
                .send(Completion {
                    direction: Direction::BToA,
                    bytes: total,
                    error,
                })
                .await;
        })
    };

    let mut report = RelayReport::default();
    for _ in 0..2 {
        match done_rx.recv().await {
            Some(completion) => report.record(completion),
            None => break,
        }
    }

    // Both halves have reported; make sure the tasks are gone before returning
    let _ = outbound.await;
    let _ = inbound.await;

    let traffic = stats.snapshot();
    debug!(
        "Tunnel closed ({}): {} bytes out, {} bytes in, {} bytes saved",
        codec.compression(),
        report.a_to_b,
        report.b_to_a,
        traffic.saved()
    );
    (report, traffic)
}

/// Answer every data message with the same payload until the peer closes
pub async fn echo<S>(ws: WebSocketStream<S>) -> Result<u64, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut messages = 0u64;

    while let Some(message) = stream.next().await {
        let payload = match message? {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => break,
            _ => continue,
        };
        sink.send(Message::Binary(payload)).await?;
        messages += 1;
    }

    let _ = sink.close().await;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{websocket, Compression};
    use tokio::io::duplex;

    async fn ws_pair(
        compression: Compression,
    ) -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
        Compression,
    ) {
        let (client, server) = duplex(256 * 1024);
        let (accepted, connected) = tokio::join!(
            websocket::accept(server),
            websocket::connect(client, "ws://localhost/", compression)
        );
        let (server_ws, negotiated) = accepted.unwrap();
        (connected.unwrap(), server_ws, negotiated)
    }

    async fn transfer_through_tunnel(compression: Compression, payload: Vec<u8>) {
        let (client_ws, server_ws, negotiated) = ws_pair(compression).await;
        assert_eq!(negotiated, compression);

        let (mut app, app_side) = duplex(64 * 1024);
        let (backend_side, mut backend) = duplex(64 * 1024);

        let codec = MessageCodec::new(compression);
        let client = tokio::spawn(bridge(client_ws, app_side, codec));
        let server = tokio::spawn(bridge(server_ws, backend_side, MessageCodec::new(negotiated)));

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            app.write_all(&payload).await.unwrap();
            app.shutdown().await.unwrap();
            app
        });

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert!(received == expected);

        // Backend closes too so both bridges finish
        backend.shutdown().await.unwrap();
        drop(backend);

        let mut app = writer.await.unwrap();
        let mut tail = Vec::new();
        app.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());

        let (client_report, client_traffic) = client.await.unwrap();
        let (server_report, _) = server.await.unwrap();
        assert_eq!(client_report.a_to_b, expected.len() as u64);
        assert_eq!(server_report.b_to_a, expected.len() as u64);
        assert_eq!(client_traffic.outbound_plain, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_bridge_plain() {
        transfer_through_tunnel(Compression::None, b"hello through the tunnel".to_vec()).await;
    }

    #[tokio::test]
    async fn test_bridge_zlib_multi_chunk() {
        let payload: Vec<u8> = (0..RELAY_CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        transfer_through_tunnel(Compression::Zlib, payload).await;
    }

    #[tokio::test]
    async fn test_bridge_empty_stream() {
        transfer_through_tunnel(Compression::Zlib, Vec::new()).await;
    }

    #[tokio::test]
    async fn test_zlib_saves_bytes_on_repetitive_data() {
        let (client_ws, server_ws, _) = ws_pair(Compression::Zlib).await;
        let (mut app, app_side) = duplex(64 * 1024);
        let (backend_side, mut backend) = duplex(64 * 1024);

        let codec = MessageCodec::new(Compression::Zlib);
        let client = tokio::spawn(bridge(client_ws, app_side, codec));
        let server = tokio::spawn(bridge(server_ws, backend_side, codec));

        tokio::spawn(async move {
            app.write_all(&vec![b'x'; 100_000]).await.unwrap();
            app.shutdown().await.unwrap();
            let mut sink = Vec::new();
            let _ = app.read_to_end(&mut sink).await;
        });

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 100_000);
        drop(backend);

        let (_, traffic) = client.await.unwrap();
        server.await.unwrap();
        assert!(traffic.saved() > 90_000);
    }

    #[tokio::test]
    async fn test_peer_close_ends_bridge_while_local_is_idle() {
        let (mut client_ws, server_ws, _) = ws_pair(Compression::None).await;

        // The local side stays open and silent for the whole test
        let (_app, app_side) = duplex(1024);
        let server = tokio::spawn(bridge(server_ws, app_side, MessageCodec::default()));

        client_ws.close(None).await.unwrap();

        let timeout = std::time::Duration::from_secs(5);
        tokio::time::timeout(timeout, async {
            while let Some(message) = client_ws.next().await {
                if message.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("close reply never arrived");

        let (report, _) = tokio::time::timeout(timeout, server)
            .await
            .expect("bridge did not finish")
            .unwrap();
        assert_eq!(report.a_to_b, 0);
        assert!(report.first_error.is_none());
    }

    #[tokio::test]
    async fn test_echo_backend() {
        let (mut client_ws, server_ws, _) = ws_pair(Compression::None).await;
        let server = tokio::spawn(echo(server_ws));

        client_ws.send(Message::Binary(b"ping".to_vec())).await.unwrap();
        let reply = client_ws.next().await.unwrap().unwrap();
        assert_eq!(reply, Message::Binary(b"ping".to_vec()));

        client_ws.close(None).await.unwrap();
        assert_eq!(server.await.unwrap().unwrap(), 1);
    }
}
