//! Payload compression used by the `Compressed` packet flag.
use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// A connection's negotiated compression mode. `None` is the default; modes
/// beyond `Gzip` are reserved for future negotiation but not yet implemented.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CompressionMode {
    None = 0,
    Gzip = 1,
}

impl From<u8> for CompressionMode {
    fn from(raw: u8) -> Self {
        match raw {
            1 => CompressionMode::Gzip,
            _ => CompressionMode::None,
        }
    }
}

impl From<CompressionMode> for u8 {
    fn from(mode: CompressionMode) -> Self {
        mode as u8
    }
}

/// Compresses `data` under `mode`. A no-op copy for `CompressionMode::None`.
pub fn compress(mode: CompressionMode, data: &[u8]) -> io::Result<Vec<u8>> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

/// Decompresses `data` under `mode`. A no-op copy for `CompressionMode::None`.
pub fn decompress(mode: CompressionMode, data: &[u8]) -> io::Result<Vec<u8>> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}
