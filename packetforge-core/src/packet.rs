//! The wire packet value type and its small closed/open enums.
//!
//! A single concrete value type carries every payload interpretation
//! (Binary/String/Json/…) rather than a family of interface implementations —
//! the payload types are polymorphic only in how `kind` tells a handler to
//! interpret the bytes, never in layout.
use crate::buffer_pool::PooledBuffer;
use std::ops::Deref;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header field order: length, id, code, number, kind, flags, priority,
/// timestamp, checksum. See DESIGN.md for the header-size arithmetic.
pub const HEADER_SIZE: usize = 2 + 2 + 2 + 1 + 1 + 1 + 1 + 8 + 4;

/// Result/status code. Not a closed enum: unknown codes received from a peer
/// must be forwarded unchanged rather than rejected, so this is a thin
/// newtype over `u16` with named constants for the codes this crate assigns
/// meaning to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Code(pub u16);

impl Code {
    pub const SUCCESS: Code = Code(0);
    pub const BAD_REQUEST: Code = Code(1);
    pub const INVALID_PAYLOAD: Code = Code(2);
    pub const PACKET_TYPE: Code = Code(3);
    pub const FORBIDDEN: Code = Code(4);
    pub const RATE_LIMITED: Code = Code(5);
    pub const CONFLICT: Code = Code(6);
    pub const TIMEOUT: Code = Code(7);
    pub const UNKNOWN_ERROR: Code = Code(8);
    pub const SERVER_ERROR: Code = Code(9);

    #[inline]
    pub fn is_success(self) -> bool {
        self == Code::SUCCESS
    }
}

impl From<u16> for Code {
    fn from(raw: u16) -> Self {
        Code(raw)
    }
}

impl From<Code> for u16 {
    fn from(code: Code) -> Self {
        code.0
    }
}

/// How a handler should interpret `payload`. `Other` preserves forward
/// compatibility with tags this build does not know about.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PayloadType {
    None,
    Binary,
    String,
    Json,
    Other(u8),
}

impl From<u8> for PayloadType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => PayloadType::None,
            1 => PayloadType::Binary,
            2 => PayloadType::String,
            3 => PayloadType::Json,
            other => PayloadType::Other(other),
        }
    }
}

impl From<PayloadType> for u8 {
    fn from(kind: PayloadType) -> Self {
        match kind {
            PayloadType::None => 0,
            PayloadType::Binary => 1,
            PayloadType::String => 2,
            PayloadType::Json => 3,
            PayloadType::Other(raw) => raw,
        }
    }
}

/// Packet flag bitset: `Encrypted`, `Compressed`, `Signed`. Bit positions are
/// normative (wire-visible).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    pub const ENCRYPTED: PacketFlags = PacketFlags(1 << 0);
    pub const COMPRESSED: PacketFlags = PacketFlags(1 << 1);
    pub const SIGNED: PacketFlags = PacketFlags(1 << 2);

    #[inline]
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn set(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn clear(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn union(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | other.0)
    }
}

/// Queue priority, ordered `Low < Medium < High < Urgent`. Declaration order
/// matches discriminant order so the derived `Ord` does the right thing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn index(self) -> usize {
        self as u8 as usize
    }
}

impl From<u8> for Priority {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Priority::Low,
            1 => Priority::Medium,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

/// Connection permission level, ordered `Guest < User < Admin < Owner`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum PermissionLevel {
    Guest = 0,
    User = 1,
    Admin = 2,
    Owner = 3,
}

impl From<u8> for PermissionLevel {
    fn from(raw: u8) -> Self {
        match raw {
            0 => PermissionLevel::Guest,
            1 => PermissionLevel::User,
            2 => PermissionLevel::Admin,
            _ => PermissionLevel::Owner,
        }
    }
}

/// Packet payload bytes, either owned or rented from a [`BufferPool`]. Both
/// forms deref to `[u8]` so callers never need to care which one they hold.
pub enum Payload {
    Owned(Vec<u8>),
    Pooled(PooledBuffer),
}

impl Payload {
    #[inline]
    pub fn empty() -> Payload {
        Payload::Owned(Vec::new())
    }

    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Payload {
        Payload::Owned(bytes.to_vec())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(v) => v.as_slice(),
            Payload::Pooled(b) => b.as_slice(),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Payload::Owned(v) => v,
            Payload::Pooled(b) => b.as_slice().to_vec(),
        }
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        Payload::Owned(self.as_slice().to_vec())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Payload {}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Owned(v)
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload").field("len", &self.len()).finish()
    }
}

/// Microseconds since the Unix epoch, used for `Packet::timestamp` and
/// expiry checks.
#[inline]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_micros() as u64
}

/// An immutable wire packet. `length` and `checksum` are invariants of
/// `payload`, not independently settable — construct through [`Packet::new`]
/// or the codec so they always hold.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    length: u16,
    id: u16,
    code: Code,
    number: u8,
    kind: PayloadType,
    flags: PacketFlags,
    priority: Priority,
    timestamp: u64,
    checksum: u32,
    payload: Payload,
}

impl Packet {
    /// Builds a fresh packet, computing `timestamp`, `checksum` and `length`
    /// from the supplied payload.
    pub fn new(
        id: u16,
        code: Code,
        number: u8,
        kind: PayloadType,
        flags: PacketFlags,
        priority: Priority,
        payload: impl Into<Payload>,
    ) -> Packet {
        let payload = payload.into();
        let checksum = crc32fast::hash(payload.as_slice());
        let length = (HEADER_SIZE + payload.len()) as u16;

        Packet {
            length,
            id,
            code,
            number,
            kind,
            flags,
            priority,
            timestamp: now_micros(),
            checksum,
            payload,
        }
    }

    /// Low-level constructor used by the codec when reassembling a packet
    /// from wire bytes: every field, including `checksum` and `timestamp`,
    /// is taken verbatim rather than recomputed.
    pub(crate) fn from_wire_fields(
        length: u16,
        id: u16,
        code: Code,
        number: u8,
        kind: PayloadType,
        flags: PacketFlags,
        priority: Priority,
        timestamp: u64,
        checksum: u32,
        payload: Payload,
    ) -> Packet {
        Packet {
            length,
            id,
            code,
            number,
            kind,
            flags,
            priority,
            timestamp,
            checksum,
            payload,
        }
    }

    #[inline]
    pub fn length(&self) -> u16 {
        self.length
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    #[inline]
    pub fn set_code(&mut self, code: Code) {
        self.code = code;
    }

    #[inline]
    pub fn number(&self) -> u8 {
        self.number
    }

    #[inline]
    pub fn kind(&self) -> PayloadType {
        self.kind
    }

    #[inline]
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    #[inline]
    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags;
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload.into_vec()
    }

    /// Replaces the payload in place, recomputing `checksum` and `length`.
    /// Used by the dispatcher when decrypting/decompressing a received
    /// packet or encrypting/compressing an outbound one.
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Packet {
        let payload = payload.into();
        self.checksum = crc32fast::hash(payload.as_slice());
        self.length = (HEADER_SIZE + payload.len()) as u16;
        self.payload = payload;
        self
    }

    /// `true` once `now_micros() - timestamp > timeout_micros`.
    pub fn is_expired(&self, timeout_micros: u64) -> bool {
        now_micros().saturating_sub(self.timestamp) > timeout_micros
    }
}
