//! Serialize/deserialize a [`Packet`] to and from its wire representation.
//!
//! All failure modes surface as [`PacketCodecError`]; nothing here panics on
//! malformed input. The header is fixed, little-endian and tightly packed —
//! see [`HEADER_SIZE`] and the field order documented there.
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::PacketCodecError;
use crate::packet::{Code, Packet, PacketFlags, Payload, PayloadType, Priority, HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use std::ops::Deref;

/// Above this total frame size, `serialize` rents from the pool instead of
/// writing to an inline stack buffer.
const INLINE_THRESHOLD: usize = 1024;

/// Payload size below which `deserialize` prefers a pooled buffer over a
/// fresh heap allocation.
const POOLED_PAYLOAD_THRESHOLD: usize = 4096;

/// A serialized frame: either an inline stack buffer (small frames) or a
/// buffer rented from a [`BufferPool`] (large frames). Both deref to `[u8]`.
pub enum SerializedFrame {
    Inline(SmallVec<[u8; INLINE_THRESHOLD]>),
    Pooled(PooledBuffer),
}

impl Deref for SerializedFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            SerializedFrame::Inline(buf) => buf.as_slice(),
            SerializedFrame::Pooled(buf) => buf.as_slice(),
        }
    }
}

fn write_header(dst: &mut [u8], packet: &Packet) {
    LittleEndian::write_u16(&mut dst[0..2], packet.length());
    LittleEndian::write_u16(&mut dst[2..4], packet.id());
    LittleEndian::write_u16(&mut dst[4..6], packet.code().into());
    dst[6] = packet.number();
    dst[7] = packet.kind().into();
    dst[8] = packet.flags().0;
    dst[9] = packet.priority() as u8;
    LittleEndian::write_u64(&mut dst[10..18], packet.timestamp());
    LittleEndian::write_u32(&mut dst[18..22], packet.checksum());
}

/// Writes `packet` into `dst` in place. Returns the number of bytes written,
/// or `None` if `dst` is too small or the packet is oversize.
pub fn try_serialize(packet: &Packet, dst: &mut [u8]) -> Option<usize> {
    let total = HEADER_SIZE + packet.payload().len();
    if packet.payload().len() > u16::MAX as usize - HEADER_SIZE {
        return None;
    }
    if dst.len() < total {
        return None;
    }

    write_header(dst, packet);
    dst[HEADER_SIZE..total].copy_from_slice(packet.payload());
    Some(total)
}

/// Serializes `packet`, using an inline buffer for small frames and the
/// supplied pool for anything above [`INLINE_THRESHOLD`] bytes.
pub fn serialize(pool: &BufferPool, packet: &Packet) -> Result<SerializedFrame, PacketCodecError> {
    let payload_len = packet.payload().len();
    if payload_len > u16::MAX as usize - HEADER_SIZE {
        return Err(PacketCodecError::Oversize);
    }

    let total = HEADER_SIZE + payload_len;

    if total <= INLINE_THRESHOLD {
        let mut buf: SmallVec<[u8; INLINE_THRESHOLD]> = smallvec::smallvec![0u8; total];
        write_header(&mut buf, packet);
        buf[HEADER_SIZE..total].copy_from_slice(packet.payload());
        Ok(SerializedFrame::Inline(buf))
    } else {
        let mut buf = pool.rent(total);
        buf.set_len(total);
        write_header(buf.as_mut_slice(), packet);
        buf.as_mut_slice()[HEADER_SIZE..total].copy_from_slice(packet.payload());
        Ok(SerializedFrame::Pooled(buf))
    }
}

fn read_header(bytes: &[u8]) -> (u16, u16, Code, u8, PayloadType, PacketFlags, Priority, u64, u32) {
    let length = LittleEndian::read_u16(&bytes[0..2]);
    let id = LittleEndian::read_u16(&bytes[2..4]);
    let code = Code::from(LittleEndian::read_u16(&bytes[4..6]));
    let number = bytes[6];
    let kind = PayloadType::from(bytes[7]);
    let flags = PacketFlags(bytes[8]);
    let priority = Priority::from(bytes[9]);
    let timestamp = LittleEndian::read_u64(&bytes[10..18]);
    let checksum = LittleEndian::read_u32(&bytes[18..22]);
    (length, id, code, number, kind, flags, priority, timestamp, checksum)
}

/// Parses `bytes` into a [`Packet`], requiring `bytes.len() >= HEADER_SIZE`
/// and a `length` field consistent with the available data. Payloads at or
/// below [`POOLED_PAYLOAD_THRESHOLD`] bytes are copied into a buffer rented
/// from `pool`; larger payloads get a fresh `Vec`.
pub fn deserialize(pool: &BufferPool, bytes: &[u8]) -> Result<Packet, PacketCodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(PacketCodecError::ShortBuffer);
    }

    let (length, id, code, number, kind, flags, priority, timestamp, checksum) = read_header(bytes);

    let length_usize = length as usize;
    if length_usize < HEADER_SIZE || length_usize > bytes.len() {
        return Err(PacketCodecError::BadLength);
    }

    let payload_bytes = &bytes[HEADER_SIZE..length_usize];

    let payload = if payload_bytes.len() <= POOLED_PAYLOAD_THRESHOLD && !payload_bytes.is_empty() {
        let mut buf = pool.rent(payload_bytes.len());
        buf.as_mut_slice().copy_from_slice(payload_bytes);
        Payload::Pooled(buf)
    } else {
        Payload::from_slice(payload_bytes)
    };

    Ok(Packet::from_wire_fields(
        length, id, code, number, kind, flags, priority, timestamp, checksum, payload,
    ))
}

/// Non-throwing form of [`deserialize`]: `None` on any parse error.
pub fn try_deserialize(pool: &BufferPool, bytes: &[u8]) -> Option<Packet> {
    deserialize(pool, bytes).ok()
}

/// `true` iff the packet's stored checksum matches the CRC-32 of its payload.
pub fn verify_checksum(packet: &Packet) -> bool {
    crc32fast::hash(packet.payload()) == packet.checksum()
}

/// Length in bytes of the trailing SHA-256 digest appended by [`sign`].
pub const SIGNATURE_SIZE: usize = 32;

fn header_bytes_with_signed_bit(packet: &Packet) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    write_header(&mut buf, packet);
    let mut flags = packet.flags();
    flags.set(PacketFlags::SIGNED);
    buf[8] = flags.0;
    buf
}

/// Appends a SHA-256 digest of `header‖payload` (with the `Signed` bit
/// treated as set during hashing) to the payload and sets the `Signed` flag.
pub fn sign(packet: &Packet) -> Packet {
    use sha2::{Digest, Sha256};

    let header = header_bytes_with_signed_bit(packet);
    let mut hasher = Sha256::new();
    hasher.update(header);
    hasher.update(packet.payload());
    let digest = hasher.finalize();

    let mut signed_payload = packet.payload().to_vec();
    signed_payload.extend_from_slice(&digest);

    let mut flags = packet.flags();
    flags.set(PacketFlags::SIGNED);

    let mut signed = packet.clone().with_payload(signed_payload);
    signed.set_flags(flags);
    signed
}

/// Recomputes the expected digest and compares it against the trailing 32
/// bytes of the payload. Returns `false` if the `Signed` flag is unset or
/// the payload is too short to carry a signature.
pub fn verify_signature(packet: &Packet) -> bool {
    use sha2::{Digest, Sha256};

    if !packet.flags().contains(PacketFlags::SIGNED) {
        return false;
    }

    let payload = packet.payload();
    if payload.len() < SIGNATURE_SIZE {
        return false;
    }

    let split = payload.len() - SIGNATURE_SIZE;
    let body = payload[..split].to_vec();
    let signature = &payload[split..];

    // Re-derive the header the same way `sign` did: over the body alone, so
    // `length`/`checksum` land back on their pre-signing values.
    let unsigned = packet.clone().with_payload(body.clone());
    let header = header_bytes_with_signed_bit(&unsigned);

    let mut hasher = Sha256::new();
    hasher.update(header);
    hasher.update(&body);
    let digest = hasher.finalize();

    digest.as_slice() == signature
}

/// Removes the trailing 32-byte signature and clears the `Signed` flag.
/// A no-op (other than clearing the flag) if the payload is too short to
/// have carried a signature.
pub fn strip_signature(packet: &Packet) -> Packet {
    let payload = packet.payload();
    let body = if payload.len() >= SIGNATURE_SIZE {
        payload[..payload.len() - SIGNATURE_SIZE].to_vec()
    } else {
        payload.to_vec()
    };

    let mut flags = packet.flags();
    flags.clear(PacketFlags::SIGNED);

    let mut stripped = packet.clone().with_payload(body);
    stripped.set_flags(flags);
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolConfig;

    fn pool() -> BufferPool {
        BufferPool::new(BufferPoolConfig::default())
    }

    fn sample_packet(payload: &[u8]) -> Packet {
        Packet::new(
            0x0100,
            Code::SUCCESS,
            7,
            PayloadType::Binary,
            PacketFlags::NONE,
            Priority::High,
            payload.to_vec(),
        )
    }

    #[test]
    fn round_trip_small_payload() {
        let pool = pool();
        let original = sample_packet(b"ping");
        let frame = serialize(&pool, &original).unwrap();
        let parsed = deserialize(&pool, &frame).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn round_trip_large_payload_uses_pool() {
        let pool = pool();
        let payload = vec![0xAB; 5000];
        let original = sample_packet(&payload);
        let frame = serialize(&pool, &original).unwrap();
        assert!(matches!(frame, SerializedFrame::Pooled(_)));
        let parsed = deserialize(&pool, &frame).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn round_trip_empty_payload() {
        let pool = pool();
        let original = sample_packet(b"");
        let frame = serialize(&pool, &original).unwrap();
        let parsed = deserialize(&pool, &frame).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn length_field_is_first_two_bytes() {
        let pool = pool();
        let original = sample_packet(b"hello world");
        let frame = serialize(&pool, &original).unwrap();
        let length = LittleEndian::read_u16(&frame[0..2]);
        assert_eq!(length as usize, HEADER_SIZE + 11);
    }

    #[test]
    fn flipped_bit_breaks_checksum() {
        let mut payload = b"flip me".to_vec();
        let original = sample_packet(&payload);
        payload[0] ^= 0x01;
        let tampered = original.clone().with_payload(payload);
        assert!(!verify_checksum(&tampered));
    }

    #[test]
    fn deserialize_rejects_short_buffer() {
        let pool = pool();
        let err = deserialize(&pool, &[0u8; 4]).unwrap_err();
        assert_eq!(err, PacketCodecError::ShortBuffer);
    }

    #[test]
    fn deserialize_rejects_bad_length() {
        let pool = pool();
        let mut bytes = vec![0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut bytes[0..2], u16::MAX);
        let err = deserialize(&pool, &bytes).unwrap_err();
        assert_eq!(err, PacketCodecError::BadLength);
    }

    #[test]
    fn serialize_rejects_oversize_payload() {
        let pool = pool();
        let payload = vec![0u8; u16::MAX as usize - HEADER_SIZE + 1];
        let packet = sample_packet(&payload);
        let err = serialize(&pool, &packet).unwrap_err();
        assert_eq!(err, PacketCodecError::Oversize);
    }

    #[test]
    fn try_serialize_rejects_short_destination() {
        let original = sample_packet(b"abcdefgh");
        let mut dst = [0u8; 4];
        assert_eq!(try_serialize(&original, &mut dst), None);
    }

    #[test]
    fn try_serialize_writes_in_place() {
        let original = sample_packet(b"abcdefgh");
        let mut dst = [0u8; 64];
        let written = try_serialize(&original, &mut dst).unwrap();
        assert_eq!(written, HEADER_SIZE + 8);
    }

    #[test]
    fn sign_sets_flag_and_verifies() {
        let original = sample_packet(b"payload");
        let signed = sign(&original);
        assert!(signed.flags().contains(PacketFlags::SIGNED));
        assert_eq!(signed.payload().len(), original.payload().len() + SIGNATURE_SIZE);
        assert!(verify_signature(&signed));
    }

    #[test]
    fn tampered_signed_payload_fails_verification() {
        let original = sample_packet(b"payload");
        let mut signed = sign(&original);
        let mut payload = signed.payload().to_vec();
        payload[0] ^= 0xFF;
        signed = signed.with_payload(payload);
        assert!(!verify_signature(&signed));
    }

    #[test]
    fn unsigned_packet_fails_verification() {
        let original = sample_packet(b"payload");
        assert!(!verify_signature(&original));
    }

    #[test]
    fn strip_signature_recovers_original_payload() {
        let original = sample_packet(b"payload");
        let signed = sign(&original);
        let stripped = strip_signature(&signed);
        assert!(!stripped.flags().contains(PacketFlags::SIGNED));
        assert_eq!(stripped.payload(), original.payload());
    }

    use proptest::prelude::*;

    proptest! {
        /// Codec round-trip: for any payload up to a few KB and any header
        /// field combination, `deserialize(serialize(p)) == p`.
        #[test]
        fn round_trip_is_field_wise_identity(
            id: u16,
            number: u8,
            kind_raw: u8,
            priority_raw in 0u8..4,
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
        ) {
            let pool = pool();
            let original = Packet::new(
                id,
                Code::SUCCESS,
                number,
                PayloadType::from(kind_raw),
                PacketFlags::NONE,
                Priority::from(priority_raw),
                payload,
            );
            let frame = serialize(&pool, &original).unwrap();
            let parsed = deserialize(&pool, &frame).unwrap();
            prop_assert_eq!(original, parsed);
        }

        /// Flipping any single bit of the payload breaks the checksum check.
        #[test]
        fn any_bit_flip_breaks_checksum(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            flip_byte_idx: usize,
            flip_bit in 0u8..8,
        ) {
            let original = sample_packet(&payload);
            let idx = flip_byte_idx % payload.len();
            let mut tampered_payload = payload.clone();
            tampered_payload[idx] ^= 1 << flip_bit;
            let tampered = original.clone().with_payload(tampered_payload);
            prop_assert!(!verify_checksum(&tampered));
        }

        /// The first two bytes of any serialized frame equal `header_size + payload.len`.
        #[test]
        fn length_prefix_matches_total_size(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let pool = pool();
            let packet = sample_packet(&payload);
            let frame = serialize(&pool, &packet).unwrap();
            let length = LittleEndian::read_u16(&frame[0..2]);
            prop_assert_eq!(length as usize, HEADER_SIZE + payload.len());
        }
    }
}
