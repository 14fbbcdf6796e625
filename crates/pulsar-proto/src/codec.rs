//! Composition of the serialization and compression layers.
//!
//! A payload on the wire is `compress(version_byte + postcard(packet))`.
//! Both endpoints call through here so the layering cannot drift between
//! client and server.

use crate::compress::{self, CompressionError, CompressionKind};
use crate::packet::{self, Packet, PacketError};

/// Errors raised while encoding or decoding a full payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Turn a packet into a wire-ready payload.
pub fn encode_payload(packet: &Packet, kind: CompressionKind) -> Result<Vec<u8>, CodecError> {
    let raw = packet::serialize_packet(packet)?;
    Ok(compress::compress(&raw, kind)?)
}

/// Turn a wire payload back into a packet.
pub fn decode_payload(buf: &[u8], kind: CompressionKind) -> Result<Packet, CodecError> {
    let raw = compress::decompress(buf, kind)?;
    Ok(packet::deserialize_packet(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CacheMode, PeerId};

    #[test]
    fn test_payload_roundtrip_all_codecs() {
        let packet = Packet::GlobalRpc {
            sender: PeerId(3),
            cache: CacheMode::Append,
            rpc_id: 7,
            args: b"position update".to_vec(),
        };

        for kind in [
            CompressionKind::None,
            CompressionKind::Deflate,
            CompressionKind::Gzip,
        ] {
            let bytes = encode_payload(&packet, kind).unwrap();
            let decoded = decode_payload(&bytes, kind).unwrap();
            assert_eq!(decoded, packet, "roundtrip failed for {kind:?}");
        }
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let result = decode_payload(&[0xFF, 0x00, 0xAB], CompressionKind::Deflate);
        assert!(result.is_err());
    }
}
