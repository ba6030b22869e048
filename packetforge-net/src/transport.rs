//! Length-prefixed framed I/O over a connected `TcpStream`.
//!
//! The receive side is a single logical task per connection; the send side
//! is callable from any task but serialized behind an internal mutex, so
//! frames from concurrent callers never interleave on the wire.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use packetforge_core::buffer_pool::BufferPool;
use packetforge_core::cache::{dedup_key, BinaryCache};
use packetforge_core::packet::now_micros;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::TransportError;

/// Frames declaring a `length` field above this are dropped rather than
/// buffered, regardless of whether the pool could technically supply one.
const DEFAULT_MAX_BUFFER_SIZE: usize = 65536;

struct ReceiveHalf {
    stream: tokio::net::tcp::OwnedReadHalf,
    pool: BufferPool,
    max_buffer_size: usize,
}

struct SendHalf {
    stream: tokio::net::tcp::OwnedWriteHalf,
    /// Observability-only: records recently sent frame keys. Deduplication
    /// (skipping a resend) is never performed, only the cache population.
    outgoing: BinaryCache,
}

/// Wraps one accepted socket's read and write halves. Cloning a handle is
/// cheap (an `Arc`); both halves are independently lockable so a read loop
/// and a concurrent sender never contend on the same mutex.
#[derive(Clone)]
pub struct TransportStream {
    recv: Arc<AsyncMutex<ReceiveHalf>>,
    send: Arc<AsyncMutex<SendHalf>>,
    last_activity_micros: Arc<AtomicU64>,
}

impl TransportStream {
    pub fn new(stream: TcpStream, pool: BufferPool, dedup_capacity: usize) -> TransportStream {
        let (read_half, write_half) = stream.into_split();
        TransportStream {
            recv: Arc::new(AsyncMutex::new(ReceiveHalf {
                stream: read_half,
                pool,
                max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            })),
            send: Arc::new(AsyncMutex::new(SendHalf {
                stream: write_half,
                outgoing: BinaryCache::new(dedup_capacity),
            })),
            last_activity_micros: Arc::new(AtomicU64::new(now_micros())),
        }
    }

    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> TransportStream {
        // `recv` is the sole owner at construction time; this is only ever
        // called before the stream is shared across tasks.
        if let Some(recv) = Arc::get_mut(&mut self.recv) {
            recv.get_mut().max_buffer_size = max_buffer_size;
        }
        self
    }

    /// Microseconds since the epoch of the last successful send or receive.
    pub fn last_activity_micros(&self) -> u64 {
        self.last_activity_micros.load(Ordering::Relaxed)
    }

    /// Reads one complete frame: a 2-byte little-endian length prefix
    /// followed by `length - 2` bytes. Returns the whole frame, header
    /// included, ready for [`packetforge_core::codec::deserialize`].
    ///
    /// A frame declaring a length above `max_buffer_size` is drained from the
    /// stream (not buffered) and reported as [`TransportError::FrameTooLarge`]
    /// so the caller can count the violation and keep the connection alive
    /// rather than disconnect on the first oversize header; the stream stays
    /// correctly positioned for the next frame's length prefix either way.
    pub async fn recv_frame(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.recv.lock().await;
        let ReceiveHalf { stream, pool, max_buffer_size } = &mut *guard;

        let mut length_bytes = [0u8; 2];
        stream.read_exact(&mut length_bytes).await?;
        let length = u16::from_le_bytes(length_bytes) as usize;

        if length < 2 {
            // The length field can't even cover itself; there is no way to
            // know how many bytes of this bogus frame to discard, so the
            // stream must be treated as desynced from here on.
            return Err(TransportError::Malformed);
        }

        let remaining = length - 2;

        if length > *max_buffer_size {
            Self::discard(stream, remaining).await?;
            return Err(TransportError::FrameTooLarge);
        }

        let mut buf = pool.rent(length);
        buf.set_len(length);
        buf.as_mut_slice()[0..2].copy_from_slice(&length_bytes);
        stream.read_exact(&mut buf.as_mut_slice()[2..2 + remaining]).await?;

        self.last_activity_micros.store(now_micros(), Ordering::Relaxed);
        Ok(buf.as_slice().to_vec())
    }

    /// Reads and discards exactly `n` bytes in fixed-size chunks, without
    /// ever buffering the whole (oversize) frame at once.
    async fn discard(stream: &mut tokio::net::tcp::OwnedReadHalf, mut n: usize) -> Result<(), TransportError> {
        let mut scratch = [0u8; 4096];
        while n > 0 {
            let chunk = n.min(scratch.len());
            stream.read_exact(&mut scratch[..chunk]).await?;
            n -= chunk;
        }
        Ok(())
    }

    /// Writes `bytes` to the socket, recording a dedup key for observability
    /// before doing so. Never skips the send on a cache hit.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.send.lock().await;
        let key = dedup_key(bytes);
        guard.outgoing.put(key, bytes.to_vec());
        guard.stream.write_all(bytes).await?;
        guard.stream.flush().await?;
        self.last_activity_micros.store(now_micros(), Ordering::Relaxed);
        Ok(())
    }
}
