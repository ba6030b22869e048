//! Reserved-range built-in command handlers: key exchange, session/keep-alive
//! and compression/encryption mode negotiation.
//!
//! Every command id here lives in `0xFF00..=0xFFFF`, the range §4.I of the
//! protocol carves out for the server itself rather than application
//! controllers. Each handler is a plain `#[handler]`-annotated async fn;
//! [`builtin_descriptors`] collects the generated descriptors for whoever
//! assembles the dispatcher's full handler list.
use std::sync::Arc;
use std::time::Duration;

use packetforge_core::crypto::{HandshakeKeypair, KEY_SIZE};
use packetforge_core::packet::{Code, Packet, PacketFlags, PayloadType, PermissionLevel, Priority};
use packetforge_macros::handler;

use crate::connection::{Connection, ConnectionState, EncryptionMode, MetadataValue};

/// Command id range reserved for this module; application controllers must
/// not register handlers inside it.
pub const RESERVED_RANGE_START: u16 = 0xFF00;
pub const RESERVED_RANGE_END: u16 = 0xFFFF;

pub const START_HANDSHAKE: u16 = 0xFF00;
pub const COMPLETE_HANDSHAKE: u16 = 0xFF01;
pub const DISCONNECT: u16 = 0xFF10;
pub const CONNECTION_STATUS: u16 = 0xFF11;
pub const PING_TIME: u16 = 0xFF12;
pub const PING: u16 = 0xFF13;
pub const PONG: u16 = 0xFF14;
pub const SET_COMPRESSION_MODE: u16 = 0xFF20;
pub const SET_ENCRYPTION_MODE: u16 = 0xFF21;

const HANDSHAKE_PRIVATE_KEY_META: &str = "X25519_PrivateKey";
const HANDSHAKE_STARTED_AT_META: &str = "X25519_HandshakeStartedAt";
const HANDSHAKE_REPLAY_WINDOW: Duration = Duration::from_secs(10);

fn status_packet(request: &Packet, code: Code) -> Packet {
    Packet::new(request.id(), code, request.number(), PayloadType::None, PacketFlags::NONE, request.priority(), Vec::new())
}

fn binary_packet(request: &Packet, code: Code, payload: Vec<u8>) -> Packet {
    Packet::new(request.id(), code, request.number(), PayloadType::Binary, PacketFlags::NONE, request.priority(), payload)
}

fn json_packet(request: &Packet, code: Code, body: serde_json::Value) -> Packet {
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    Packet::new(request.id(), code, request.number(), PayloadType::Json, PacketFlags::NONE, request.priority(), payload)
}

/// `StartHandshake(public_key: 32B)`. Rejects a second attempt from the same
/// connection inside [`HANDSHAKE_REPLAY_WINDOW`] with `RateLimited`,
/// otherwise generates a fresh server keypair, derives the shared secret and
/// stores it as the connection's pending `encryption_key`, and upgrades the
/// connection to `User` immediately (it is only `Authenticated` once
/// `CompleteHandshake` confirms the client derived the same key).
#[handler(id = START_HANDSHAKE, permission = Guest, encryption_required = false)]
pub async fn start_handshake(packet: Packet, conn: Arc<Connection>) -> Option<Packet> {
    if packet.payload().len() != KEY_SIZE {
        return Some(status_packet(&packet, Code::INVALID_PAYLOAD));
    }

    if let Some(MetadataValue::U64(started_at)) = conn.metadata_get(HANDSHAKE_STARTED_AT_META) {
        let now = packetforge_core::packet::now_micros();
        if now.saturating_sub(started_at) < HANDSHAKE_REPLAY_WINDOW.as_micros() as u64 {
            return Some(status_packet(&packet, Code::RATE_LIMITED));
        }
    }

    let mut client_public = [0u8; KEY_SIZE];
    client_public.copy_from_slice(packet.payload());

    let keypair = HandshakeKeypair::generate();
    let shared_key = keypair.derive_shared_key(&client_public);
    let server_public = keypair.public_bytes();

    conn.metadata_set(HANDSHAKE_PRIVATE_KEY_META, MetadataValue::HandshakeKeypair(Arc::new(keypair)));
    conn.metadata_set(HANDSHAKE_STARTED_AT_META, MetadataValue::U64(packetforge_core::packet::now_micros()));
    conn.set_encryption_key(shared_key);
    conn.set_permission(PermissionLevel::User);

    Some(binary_packet(&packet, Code::SUCCESS, server_public.to_vec()))
}

/// `CompleteHandshake(public_key: 32B)`. Re-derives the shared secret from
/// the stored server keypair and the supplied client public key; transitions
/// to `Authenticated` on a match, or `Conflict` if the client sent a
/// different public key than it used in `StartHandshake`.
#[handler(id = COMPLETE_HANDSHAKE, permission = Guest, encryption_required = false)]
pub async fn complete_handshake(packet: Packet, conn: Arc<Connection>) -> Option<Packet> {
    if packet.payload().len() != KEY_SIZE {
        return Some(status_packet(&packet, Code::INVALID_PAYLOAD));
    }

    let keypair = match conn.metadata_get(HANDSHAKE_PRIVATE_KEY_META) {
        Some(MetadataValue::HandshakeKeypair(keypair)) => keypair,
        _ => return Some(status_packet(&packet, Code::CONFLICT)),
    };

    let mut client_public = [0u8; KEY_SIZE];
    client_public.copy_from_slice(packet.payload());
    let recomputed = keypair.derive_shared_key(&client_public);

    match conn.encryption_key() {
        Some(stored) if stored == recomputed => {
            conn.set_state(ConnectionState::Authenticated);
            conn.metadata_remove(HANDSHAKE_PRIVATE_KEY_META);
            conn.metadata_remove(HANDSHAKE_STARTED_AT_META);
            Some(status_packet(&packet, Code::SUCCESS))
        }
        _ => Some(status_packet(&packet, Code::CONFLICT)),
    }
}

/// `Disconnect`: tears down the connection. The `on_closed` fan-out is
/// idempotent, so firing it here races harmlessly with the transport's own
/// EOF-triggered close.
#[handler(id = DISCONNECT, permission = Guest, encryption_required = false)]
pub async fn disconnect(packet: Packet, conn: Arc<Connection>) -> Option<Packet> {
    let response = status_packet(&packet, Code::SUCCESS);
    conn.fire_on_closed();
    Some(response)
}

/// `ConnectionStatus`: reports the negotiated compression and encryption
/// modes as a small JSON object.
#[handler(id = CONNECTION_STATUS, permission = Guest, encryption_required = false)]
pub async fn connection_status(packet: Packet, conn: Arc<Connection>) -> Option<Packet> {
    let body = serde_json::json!({
        "compression_mode": u8::from(conn.compression_mode()),
        "encryption_mode": conn.encryption_mode() as u8,
        "state": conn.state() as u8,
    });
    Some(json_packet(&packet, Code::SUCCESS, body))
}

/// `PingTime`: reports microseconds since the connection's last successful
/// frame activity, the closest liveness signal the transport tracks without
/// a dedicated round-trip timer.
#[handler(id = PING_TIME, permission = Guest, encryption_required = false)]
pub async fn ping_time(packet: Packet, conn: Arc<Connection>) -> Option<Packet> {
    let elapsed = packetforge_core::packet::now_micros().saturating_sub(conn.last_activity_micros());
    Some(binary_packet(&packet, Code::SUCCESS, elapsed.to_le_bytes().to_vec()))
}

/// `Ping`: a cheap keep-alive echo. The dispatcher's own send path already
/// refreshes `last_activity_micros`, so the handler body only needs to ack.
#[handler(id = PING, permission = Guest, encryption_required = false, rate_group = "ping", max_requests = 10, window_ms = 1000)]
pub async fn ping(packet: Packet, _conn: Arc<Connection>) -> Option<Packet> {
    Some(status_packet(&packet, Code::SUCCESS))
}

/// `Pong`: the client-initiated counterpart to [`ping`] for peers that
/// prefer to originate the keep-alive themselves. Shares `ping`'s rate
/// group since both exist purely to refresh liveness and cost the same.
#[handler(id = PONG, permission = Guest, encryption_required = false, rate_group = "ping", max_requests = 10, window_ms = 1000)]
pub async fn pong(packet: Packet, _conn: Arc<Connection>) -> Option<Packet> {
    Some(status_packet(&packet, Code::SUCCESS))
}

/// `SetCompressionMode(u8)`. Rejected unless the byte names a known mode.
#[handler(id = SET_COMPRESSION_MODE, permission = Guest, encryption_required = false)]
pub async fn set_compression_mode(packet: Packet, conn: Arc<Connection>) -> Option<Packet> {
    let [raw] = match packet.payload() {
        [raw] => [*raw],
        _ => return Some(status_packet(&packet, Code::INVALID_PAYLOAD)),
    };
    if raw > 1 {
        return Some(status_packet(&packet, Code::BAD_REQUEST));
    }
    conn.set_compression_mode(raw.into());
    Some(status_packet(&packet, Code::SUCCESS))
}

/// `SetEncryptionMode(u8)`. Rejected unless the byte names a known mode.
#[handler(id = SET_ENCRYPTION_MODE, permission = Guest, encryption_required = false)]
pub async fn set_encryption_mode(packet: Packet, conn: Arc<Connection>) -> Option<Packet> {
    let [raw] = match packet.payload() {
        [raw] => [*raw],
        _ => return Some(status_packet(&packet, Code::INVALID_PAYLOAD)),
    };
    if raw > 1 {
        return Some(status_packet(&packet, Code::BAD_REQUEST));
    }
    conn.set_encryption_mode(EncryptionMode::from(raw));
    Some(status_packet(&packet, Code::SUCCESS))
}

/// Every built-in handler descriptor, ready to be chained onto an
/// application's own handler list before constructing the [`crate::dispatcher::Dispatcher`].
pub fn builtin_descriptors() -> Vec<crate::dispatcher::HandlerDescriptor> {
    vec![
        start_handshake_descriptor(),
        complete_handshake_descriptor(),
        disconnect_descriptor(),
        connection_status_descriptor(),
        ping_time_descriptor(),
        ping_descriptor(),
        pong_descriptor(),
        set_compression_mode_descriptor(),
        set_encryption_mode_descriptor(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use packetforge_core::buffer_pool::BufferPool;
    use packetforge_core::buffer_pool::BufferPoolConfig;
    use tokio::net::{TcpListener, TcpStream};

    use crate::transport::TransportStream;

    async fn test_connection() -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server_side, client_side) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { TcpStream::connect(addr).await.unwrap() }
        );
        std::mem::forget(client_side);
        let pool = BufferPool::new(BufferPoolConfig::default());
        let transport = TransportStream::new(server_side, pool, 64);
        Connection::new(1, "127.0.0.1:1".parse().unwrap(), transport)
    }

    fn request(id: u16, payload: &[u8]) -> Packet {
        Packet::new(id, Code::SUCCESS, 1, PayloadType::Binary, PacketFlags::NONE, Priority::Medium, payload.to_vec())
    }

    #[tokio::test]
    async fn full_handshake_authenticates_connection() {
        let conn = test_connection().await;
        let client = HandshakeKeypair::generate();
        let client_public = client.public_bytes();

        let start_response = start_handshake(request(START_HANDSHAKE, &client_public), conn.clone()).await.unwrap();
        assert_eq!(start_response.code(), Code::SUCCESS);
        assert_eq!(conn.permission(), PermissionLevel::User);

        let mut server_public = [0u8; KEY_SIZE];
        server_public.copy_from_slice(start_response.payload());
        let expected_shared = client.derive_shared_key(&server_public);

        let complete_response = complete_handshake(request(COMPLETE_HANDSHAKE, &client_public), conn.clone()).await.unwrap();
        assert_eq!(complete_response.code(), Code::SUCCESS);
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.encryption_key().unwrap(), expected_shared);
    }

    #[tokio::test]
    async fn complete_handshake_with_wrong_key_conflicts() {
        let conn = test_connection().await;
        let client = HandshakeKeypair::generate();
        let other_client = HandshakeKeypair::generate();

        start_handshake(request(START_HANDSHAKE, &client.public_bytes()), conn.clone()).await.unwrap();
        let response = complete_handshake(request(COMPLETE_HANDSHAKE, &other_client.public_bytes()), conn.clone())
            .await
            .unwrap();

        assert_eq!(response.code(), Code::CONFLICT);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn repeated_start_handshake_within_window_is_rate_limited() {
        let conn = test_connection().await;
        let client = HandshakeKeypair::generate();

        let first = start_handshake(request(START_HANDSHAKE, &client.public_bytes()), conn.clone()).await.unwrap();
        assert_eq!(first.code(), Code::SUCCESS);

        let second = start_handshake(request(START_HANDSHAKE, &client.public_bytes()), conn.clone()).await.unwrap();
        assert_eq!(second.code(), Code::RATE_LIMITED);
    }

    #[tokio::test]
    async fn different_client_keys_derive_different_server_side_secrets() {
        let conn_a = test_connection().await;
        let conn_b = test_connection().await;
        let client_a = HandshakeKeypair::generate();
        let client_b = HandshakeKeypair::generate();

        start_handshake(request(START_HANDSHAKE, &client_a.public_bytes()), conn_a.clone()).await.unwrap();
        start_handshake(request(START_HANDSHAKE, &client_b.public_bytes()), conn_b.clone()).await.unwrap();

        assert_ne!(conn_a.encryption_key().unwrap(), conn_b.encryption_key().unwrap());
    }

    #[tokio::test]
    async fn set_compression_mode_rejects_unknown_value() {
        let conn = test_connection().await;
        let response = set_compression_mode(request(SET_COMPRESSION_MODE, &[9]), conn).await.unwrap();
        assert_eq!(response.code(), Code::BAD_REQUEST);
    }

    #[tokio::test]
    async fn set_compression_mode_updates_connection() {
        let conn = test_connection().await;
        let response = set_compression_mode(request(SET_COMPRESSION_MODE, &[1]), conn.clone()).await.unwrap();
        assert_eq!(response.code(), Code::SUCCESS);
        assert_eq!(u8::from(conn.compression_mode()), 1);
    }

    #[tokio::test]
    async fn connection_status_reports_json_modes() {
        let conn = test_connection().await;
        let response = connection_status(request(CONNECTION_STATUS, &[]), conn).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(response.payload()).unwrap();
        assert_eq!(body["compression_mode"], 0);
        assert_eq!(body["encryption_mode"], 0);
    }

    #[tokio::test]
    async fn disconnect_closes_connection() {
        let conn = test_connection().await;
        let response = disconnect(request(DISCONNECT, &[]), conn.clone()).await.unwrap();
        assert_eq!(response.code(), Code::SUCCESS);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reserved_range_covers_every_builtin_command_id() {
        for id in [
            START_HANDSHAKE,
            COMPLETE_HANDSHAKE,
            DISCONNECT,
            CONNECTION_STATUS,
            PING_TIME,
            PING,
            PONG,
            SET_COMPRESSION_MODE,
            SET_ENCRYPTION_MODE,
        ] {
            assert!((RESERVED_RANGE_START..=RESERVED_RANGE_END).contains(&id));
        }
    }
}
