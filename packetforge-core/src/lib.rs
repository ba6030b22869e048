//! Wire packet value type, codec, buffer pool, dedup caches and transport
//! cryptography for the packetforge protocol. Contains no I/O — sockets,
//! the connection state machine and the dispatcher live in `packetforge-net`.
pub mod buffer_pool;
pub mod cache;
pub mod codec;
pub mod compression;
pub mod crypto;
pub mod error;
pub mod packet;

pub mod prelude {
    pub use crate::buffer_pool::{BufferPool, BufferPoolConfig, PooledBuffer};
    pub use crate::cache::{BinaryCache, FifoCache};
    pub use crate::codec::{self, SerializedFrame};
    pub use crate::compression::{self, CompressionMode};
    pub use crate::crypto;
    pub use crate::error::{CryptoError, PacketCodecError};
    pub use crate::packet::{Code, PacketFlags, Payload, PayloadType, Priority, PermissionLevel};
    pub use crate::packet::Packet;
}
