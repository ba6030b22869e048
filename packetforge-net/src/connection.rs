//! Per-socket state: permission level, encryption/compression modes,
//! handshake bookkeeping and event fan-out.
//!
//! All mutable fields use interior mutability (atomics, `parking_lot`
//! locks, a concurrent map) because handlers only ever see a shared
//! `Arc<Connection>` — several frames on different connections, and in
//! principle concurrent sends on the same connection, run side by side.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use packetforge_core::compression::CompressionMode;
use packetforge_core::crypto::{HandshakeKeypair, KEY_SIZE};
use packetforge_core::packet::PermissionLevel;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportStream;

/// Monotonic connection id generator, one per listener.
#[derive(Default)]
pub struct ConnectionIdGenerator(AtomicU32);

impl ConnectionIdGenerator {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Connection lifecycle state. `Connected` accepts only handshake commands
/// plus the ping/disconnect/mode-negotiation denylist-bypass set;
/// `Authenticated` decrypts/encrypts every frame against `encryption_key`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    Connected = 0,
    Authenticated = 1,
    Disconnected = 2,
}

impl From<u8> for ConnectionState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Authenticated,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Negotiated transport encryption. `None` before a completed handshake.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum EncryptionMode {
    None = 0,
    ChaCha20Poly1305 = 1,
}

impl From<u8> for EncryptionMode {
    fn from(raw: u8) -> Self {
        match raw {
            1 => EncryptionMode::ChaCha20Poly1305,
            _ => EncryptionMode::None,
        }
    }
}

/// Values a handler can stash in a connection's metadata map. Closed rather
/// than `Box<dyn Any>` since every value this protocol needs to carry is
/// known up front.
#[derive(Clone)]
pub enum MetadataValue {
    Bytes(Vec<u8>),
    U64(u64),
    String(String),
    HandshakeKeypair(Arc<HandshakeKeypair>),
}

type EventHook = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Default)]
struct EventHooks {
    on_packet_ready: RwLock<Vec<EventHook>>,
    on_closed: RwLock<Vec<EventHook>>,
    on_post_send: RwLock<Vec<EventHook>>,
}

/// A single accepted socket and everything the dispatcher needs to know
/// about it. Created on accept, destroyed on close; owns its transport and
/// its cancellation token. Handlers hold a non-owning `Arc` clone for the
/// duration of one dispatch.
pub struct Connection {
    id: u32,
    remote: SocketAddr,
    transport: TransportStream,
    state: AtomicU8,
    permission: AtomicU8,
    encryption_mode: AtomicU8,
    compression_mode: AtomicU8,
    encryption_key: RwLock<Option<[u8; KEY_SIZE]>>,
    metadata: DashMap<String, MetadataValue>,
    consecutive_crypto_failures: AtomicU32,
    consecutive_frame_violations: AtomicU32,
    handler_failures: AtomicU32,
    send_nonce_counter: std::sync::atomic::AtomicU64,
    recv_nonce_counter: std::sync::atomic::AtomicU64,
    cancellation: CancellationToken,
    events: EventHooks,
    closed_fired: std::sync::atomic::AtomicBool,
}

impl Connection {
    pub fn new(id: u32, remote: SocketAddr, transport: TransportStream) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            remote,
            transport,
            state: AtomicU8::new(ConnectionState::Connected as u8),
            permission: AtomicU8::new(PermissionLevel::Guest as u8),
            encryption_mode: AtomicU8::new(EncryptionMode::None as u8),
            compression_mode: AtomicU8::new(CompressionMode::None as u8),
            encryption_key: RwLock::new(None),
            metadata: DashMap::new(),
            consecutive_crypto_failures: AtomicU32::new(0),
            consecutive_frame_violations: AtomicU32::new(0),
            handler_failures: AtomicU32::new(0),
            send_nonce_counter: std::sync::atomic::AtomicU64::new(0),
            recv_nonce_counter: std::sync::atomic::AtomicU64::new(0),
            cancellation: CancellationToken::new(),
            events: EventHooks::default(),
            closed_fired: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn transport(&self) -> &TransportStream {
        &self.transport
    }

    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn permission(&self) -> PermissionLevel {
        PermissionLevel::from(self.permission.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_permission(&self, level: PermissionLevel) {
        self.permission.store(level as u8, Ordering::Release);
    }

    #[inline]
    pub fn encryption_mode(&self) -> EncryptionMode {
        EncryptionMode::from(self.encryption_mode.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_encryption_mode(&self, mode: EncryptionMode) {
        self.encryption_mode.store(mode as u8, Ordering::Release);
    }

    #[inline]
    pub fn compression_mode(&self) -> CompressionMode {
        CompressionMode::from(self.compression_mode.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_compression_mode(&self, mode: CompressionMode) {
        self.compression_mode.store(mode as u8, Ordering::Release);
    }

    /// Written once at handshake completion; read lock-free-ish afterward
    /// (a `parking_lot::RwLock` read guard). Rotation, if ever added, must
    /// take the write lock and is expected to be rare.
    pub fn encryption_key(&self) -> Option<[u8; KEY_SIZE]> {
        *self.encryption_key.read()
    }

    pub fn set_encryption_key(&self, key: [u8; KEY_SIZE]) {
        *self.encryption_key.write() = Some(key);
    }

    pub fn metadata_get(&self, key: &str) -> Option<MetadataValue> {
        self.metadata.get(key).map(|entry| entry.value().clone())
    }

    pub fn metadata_set(&self, key: impl Into<String>, value: MetadataValue) {
        self.metadata.insert(key.into(), value);
    }

    pub fn metadata_remove(&self, key: &str) {
        self.metadata.remove(key);
    }

    /// `true` once three consecutive crypto failures (decrypt/decompress/parse
    /// errors) have been observed without an intervening success; the caller
    /// is expected to disconnect at that point.
    pub fn record_crypto_failure(&self) -> bool {
        self.consecutive_crypto_failures.fetch_add(1, Ordering::AcqRel) + 1 >= 3
    }

    pub fn reset_crypto_failures(&self) {
        self.consecutive_crypto_failures.store(0, Ordering::Release);
    }

    /// `true` once three consecutive oversize/malformed-length frame
    /// violations have been observed without an intervening well-formed
    /// frame; mirrors [`Connection::record_crypto_failure`]'s shape for the
    /// transport-framing layer, so a single oversize header does not close
    /// the connection but a sustained run of them does.
    pub fn record_frame_violation(&self) -> bool {
        self.consecutive_frame_violations.fetch_add(1, Ordering::AcqRel) + 1 >= 3
    }

    pub fn reset_frame_violations(&self) {
        self.consecutive_frame_violations.store(0, Ordering::Release);
    }

    pub fn record_handler_failure(&self) -> u32 {
        self.handler_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Next AEAD nonce counter for a frame this side sends, mirroring the
    /// teacher's own `server_sequence` — a dedicated monotonic counter, never
    /// the wire-visible, peer-controlled `number` field, which a peer could
    /// trivially repeat and force nonce reuse under a fixed key.
    pub fn next_send_nonce(&self) -> u64 {
        self.send_nonce_counter.fetch_add(1, Ordering::AcqRel)
    }

    /// Next AEAD nonce counter expected on a frame received from the peer,
    /// mirroring the teacher's `client_sequence`.
    pub fn next_recv_nonce(&self) -> u64 {
        self.recv_nonce_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub fn last_activity_micros(&self) -> u64 {
        self.transport.last_activity_micros()
    }

    pub fn subscribe_on_packet_ready(&self, hook: EventHook) {
        self.events.on_packet_ready.write().push(hook);
    }

    pub fn subscribe_on_closed(&self, hook: EventHook) {
        self.events.on_closed.write().push(hook);
    }

    pub fn subscribe_on_post_send(&self, hook: EventHook) {
        self.events.on_post_send.write().push(hook);
    }

    pub fn fire_on_packet_ready(&self) {
        for hook in self.events.on_packet_ready.read().iter() {
            hook(self);
        }
    }

    pub fn fire_on_post_send(&self) {
        for hook in self.events.on_post_send.read().iter() {
            hook(self);
        }
    }

    /// Fires `on_closed` exactly once even if called from multiple places
    /// (error path and explicit `Disconnect` handler, say).
    pub fn fire_on_closed(&self) {
        if self.closed_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.cancellation.cancel();
        for hook in self.events.on_closed.read().iter() {
            hook(self);
        }
    }
}
