//! Tagged error types for the transport, connection and dispatcher layers.
//!
//! Follows the same recoverable/fatal split as the rest of this workspace's
//! network error types: a `Wait` case callers retry on, and a set of fatal,
//! typed cases that close the connection.
use std::fmt;
use std::io;

/// Errors surfaced while framing bytes on or off the wire.
#[derive(Debug)]
pub enum TransportError {
    /// No complete frame available yet; not a failure.
    Wait,
    /// Declared frame length exceeds the configured maximum. The frame's
    /// bytes have already been drained from the stream, so the connection
    /// can keep reading; this is recoverable up to a violation threshold.
    FrameTooLarge,
    /// Declared length field is too small to be a valid frame. Unlike
    /// `FrameTooLarge`, there is no trustworthy byte count to drain, so the
    /// stream is treated as desynced and the connection is closed.
    Malformed,
    /// The peer closed the stream (EOF).
    Closed,
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Wait => f.write_str("no complete frame buffered yet"),
            TransportError::FrameTooLarge => f.write_str("frame exceeds max_buffer_size"),
            TransportError::Malformed => f.write_str("frame length field too small to be valid"),
            TransportError::Closed => f.write_str("peer closed the connection"),
            TransportError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::Io(err)
        }
    }
}

/// Errors surfaced by the dispatcher's per-frame pipeline. Every variant maps
/// to a response [`packetforge_core::packet::Code`] rather than propagating.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DispatchError {
    UnknownCommand,
    Forbidden,
    RateLimited,
    Timeout,
    BadPayload,
    HandlerFailed,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DispatchError::UnknownCommand => "no handler registered for command id",
            DispatchError::Forbidden => "insufficient permission or encryption state",
            DispatchError::RateLimited => "rate limit exceeded for group",
            DispatchError::Timeout => "handler exceeded its timeout",
            DispatchError::BadPayload => "payload failed to parse or decrypt",
            DispatchError::HandlerFailed => "handler returned an error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DispatchError {}

/// Fatal startup-time error: duplicate `command_id` registration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DuplicateCommandId(pub u16);

impl fmt::Display for DuplicateCommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command id {} registered more than once", self.0)
    }
}

impl std::error::Error for DuplicateCommandId {}
