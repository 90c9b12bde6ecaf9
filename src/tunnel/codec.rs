//! Per-message payload codec and traffic accounting

use super::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest payload a single inbound message may inflate to (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encodes outbound chunks and decodes inbound messages.
///
/// Compression is per message: every chunk is a complete zlib stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec {
    compression: Compression,
}

impl MessageCodec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Turn a plaintext chunk into a message payload
    pub fn encode(&self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(chunk.to_vec()),
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(
                    Vec::with_capacity(chunk.len() / 2 + 16),
                    flate2::Compression::default(),
                );
                encoder.write_all(chunk)?;
                encoder.finish()
            }
        }
    }

    /// Turn a message payload back into plaintext
    pub fn decode(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(payload.to_vec()),
            Compression::Zlib => {
                let mut plain = Vec::with_capacity(payload.len() * 2);
                ZlibDecoder::new(payload)
                    .take(MAX_MESSAGE_SIZE as u64 + 1)
                    .read_to_end(&mut plain)?;
                if plain.len() > MAX_MESSAGE_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "inflated message too large",
                    ));
                }
                Ok(plain)
            }
        }
    }
}

/// Byte counters for one or more tunnels.
///
/// "Plain" counts bytes seen by the local side, "wire" counts message
/// payload bytes on the tunnel. Outbound is local → tunnel.
#[derive(Debug, Default)]
pub struct TrafficStats {
    outbound_plain: AtomicU64,
    outbound_wire: AtomicU64,
    inbound_plain: AtomicU64,
    inbound_wire: AtomicU64,
}

impl TrafficStats {
    pub fn record_outbound(&self, plain: usize, wire: usize) {
        self.outbound_plain.fetch_add(plain as u64, Ordering::Relaxed);
        self.outbound_wire.fetch_add(wire as u64, Ordering::Relaxed);
    }

    pub fn record_inbound(&self, plain: usize, wire: usize) {
        self.inbound_plain.fetch_add(plain as u64, Ordering::Relaxed);
        self.inbound_wire.fetch_add(wire as u64, Ordering::Relaxed);
    }

    /// Add a finished tunnel's totals
    pub fn absorb(&self, other: &TrafficSnapshot) {
        self.record_outbound(other.outbound_plain as usize, other.outbound_wire as usize);
        self.record_inbound(other.inbound_plain as usize, other.inbound_wire as usize);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            outbound_plain: self.outbound_plain.load(Ordering::Relaxed),
            outbound_wire: self.outbound_wire.load(Ordering::Relaxed),
            inbound_plain: self.inbound_plain.load(Ordering::Relaxed),
            inbound_wire: self.inbound_wire.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TrafficStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub outbound_plain: u64,
    pub outbound_wire: u64,
    pub inbound_plain: u64,
    pub inbound_wire: u64,
}

impl TrafficSnapshot {
    /// Bytes saved by compression (negative when it inflated the stream)
    pub fn saved(&self) -> i64 {
        let plain = (self.outbound_plain + self.inbound_plain) as i64;
        let wire = (self.outbound_wire + self.inbound_wire) as i64;
        plain - wire
    }
}
