//! Full-duplex relay between two endpoints
//!
//! Each direction runs as its own task and reports completion on a
//! two-slot channel. The owner waits for both reports before the pair is
//! considered finished, so neither task outlives the connection.

use crate::transport::Endpoint;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

/// Bytes moved per read/write cycle
pub const RELAY_CHUNK_SIZE: usize = 32 * 1024;

/// Direction of a relay half
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first endpoint to the second
    AToB,
    /// From the second endpoint to the first
    BToA,
}

/// Completion report of one direction
#[derive(Debug)]
pub struct Completion {
    pub direction: Direction,
    pub bytes: u64,
    pub error: Option<io::Error>,
}

/// Outcome of a finished relay
#[derive(Debug, Default)]
pub struct RelayReport {
    /// Bytes copied from the first endpoint to the second
    pub a_to_b: u64,
    /// Bytes copied from the second endpoint to the first
    pub b_to_a: u64,
    /// First error reported by either direction
    pub first_error: Option<io::Error>,
}

impl RelayReport {
    /// Fold one direction's completion into the report
    pub fn record(&mut self, done: Completion) {
        match done.direction {
            Direction::AToB => self.a_to_b = done.bytes,
            Direction::BToA => self.b_to_a = done.bytes,
        }
        if self.first_error.is_none() {
            self.first_error = done.error;
        }
    }
}

/// Copy `src` into `dst` until end of stream.
///
/// Every chunk is written completely and flushed before the next read. A
/// write that cannot complete ends the direction with `WriteZero`. When
/// `src` ends (cleanly or not) `dst` is shut down so the peer observes the
/// half-close.
pub async fn copy_direction<R, W>(src: &mut R, dst: &mut W) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut total = 0u64;

    let error = loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            // Nothing more can reach the peer; skip the half-close
            return (total, Some(e));
        }
        if let Err(e) = dst.flush().await {
            return (total, Some(e));
        }
        total += n as u64;
    };

    if let Err(e) = dst.shutdown().await {
        trace!("Half-close failed: {}", e);
    }

    (total, error)
}

/// Relay bytes between `a` and `b` until both directions have finished.
pub async fn relay<A, B>(a: A, b: B) -> RelayReport
where
    A: Endpoint,
    B: Endpoint,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(2);

    let tx = done_tx.clone();
    tokio::spawn(async move {
        let (bytes, error) = copy_direction(&mut a_read, &mut b_write).await;
        let _ = tx
            .send(Completion {
                direction: Direction::AToB,
                bytes,
                error,
            })
            .await;
    });

    let tx = done_tx;
    tokio::spawn(async move {
        let (bytes, error) = copy_direction(&mut b_read, &mut a_write).await;
        let _ = tx
            .send(Completion {
                direction: Direction::BToA,
                bytes,
                error,
            })
            .await;
    });

    let mut report = RelayReport::default();
    for _ in 0..2 {
        match done_rx.recv().await {
            Some(done) => {
                trace!(
                    "Relay {:?} finished after {} bytes (error: {:?})",
                    done.direction,
                    done.bytes,
                    done.error
                );
                report.record(done);
            }
            // A task panicked before reporting
            None => break,
        }
    }

    report
}
