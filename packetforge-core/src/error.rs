//! Hand-rolled, tagged error types for the codec, pool and cache layers.
//!
//! Draws the same split between a recoverable `Wait` case and a fatal, typed
//! case: nothing in this module panics on malformed input, and every variant
//! is cheap to construct so hot paths can return early.
use std::fmt;

/// Errors surfaced by [`crate::codec`] serialize/deserialize operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketCodecError {
    /// Payload length plus header size would not fit in a `u16`.
    Oversize,
    /// The destination buffer was too small to hold the serialized frame.
    ShortBuffer,
    /// The declared `length` field is inconsistent with the available bytes.
    BadLength,
    /// `checksum` did not match the CRC-32 of `payload`.
    BadChecksum,
}

impl fmt::Display for PacketCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PacketCodecError::Oversize => "payload exceeds the maximum frame size",
            PacketCodecError::ShortBuffer => "destination buffer too small",
            PacketCodecError::BadLength => "length field inconsistent with buffer",
            PacketCodecError::BadChecksum => "checksum mismatch",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for PacketCodecError {}

/// Errors surfaced by [`crate::crypto`] encrypt/decrypt/sign operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CryptoError {
    /// AEAD seal or open failed (authentication failure or bad key length).
    SealFailed,
    /// A signature did not match the recomputed digest.
    BadSignature,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CryptoError::SealFailed => "AEAD seal/open failed",
            CryptoError::BadSignature => "signature verification failed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for CryptoError {}
