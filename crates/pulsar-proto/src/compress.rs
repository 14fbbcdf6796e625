//! Payload compression for frames and datagrams.
//!
//! Every payload that crosses the wire goes through this layer as a whole
//! unit; both sides must agree on the configured [`CompressionKind`] because
//! the wire carries no per-frame compression marker.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use serde::{Deserialize, Serialize};

/// Which codec to run payloads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    /// Pass payloads through untouched.
    None,
    /// Raw deflate, no header or checksum.
    Deflate,
    /// Gzip-wrapped deflate.
    Gzip,
}

impl Default for CompressionKind {
    fn default() -> Self {
        Self::Deflate
    }
}

/// Errors raised while compressing or decompressing a payload.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The compressor failed to consume the payload.
    #[error("compression failed: {0}")]
    Compress(std::io::Error),

    /// The payload was not valid for the configured codec, which usually
    /// means the two sides disagree on [`CompressionKind`].
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

/// Compress a payload with the given codec.
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, CompressionError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).map_err(CompressionError::Compress)?;
            encoder.finish().map_err(CompressionError::Compress)
        }
        CompressionKind::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).map_err(CompressionError::Compress)?;
            encoder.finish().map_err(CompressionError::Compress)
        }
    }
}

/// Decompress a payload with the given codec.
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, CompressionError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Deflate => {
            let mut decoder = DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(CompressionError::Decompress)?;
            Ok(out)
        }
        CompressionKind::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(CompressionError::Decompress)?;
            Ok(out)
        }
    }
}
