//! Length-prefixed framing for the reliable stream and the unreliable
//! datagram transport.
//!
//! Every unit on the reliable stream is a length-prefixed frame:
//!
//! ```text
//! +-------------------+----------------------+
//! | length (4 bytes)  |   payload            |
//! | u32 little-endian |   (length bytes)     |
//! +-------------------+----------------------+
//! ```
//!
//! A datagram is the same size-prefixed payload followed by the sending
//! peer's id as a trailer. The trailer width is asymmetric and part of the
//! wire contract: **2 bytes** in the request direction (client → server),
//! **4 bytes** in the response direction (server → client). Both widths are
//! little-endian.
//!
//! The length prefix never includes the prefix or trailer bytes themselves.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::packet::PeerId;

/// Size limits for one transport's frames.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes.
    pub max_payload_size: u32,
}

impl FrameConfig {
    /// Default limits for the reliable stream transport (1 MiB).
    pub fn reliable() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }

    /// Default limits for the unreliable datagram transport. Capped below
    /// the largest payload a UDP datagram can carry.
    pub fn unreliable() -> Self {
        Self {
            max_payload_size: 65_000,
        }
    }
}

/// Errors raised by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared payload length exceeds the transport's maximum.
    ///
    /// Raised before any payload buffer is allocated, so a hostile length
    /// prefix cannot force a large allocation.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// The declared payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The source closed before a complete frame arrived.
    #[error("source closed mid-frame")]
    Truncated,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one length-prefixed frame from the reliable stream.
///
/// Blocks until the full frame is available. Returns
/// [`FrameError::Truncated`] if the peer closes the stream partway through.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Truncated);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::FrameTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::Truncated
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(payload)
}

/// Write one length-prefixed frame to the reliable stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = payload.len() as u32;
    if len > config.max_payload_size {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Encode a request-direction datagram (client → server): size-prefixed
/// payload followed by the sender's peer id as a 2-byte trailer.
pub fn encode_request_datagram(
    payload: &[u8],
    sender: PeerId,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let len = payload.len() as u32;
    if len > config.max_payload_size {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    let mut out = Vec::with_capacity(4 + payload.len() + 2);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&sender.0.to_le_bytes());
    Ok(out)
}

/// Decode a request-direction datagram. Returns the payload and the peer id
/// read from the 2-byte trailer.
pub fn decode_request_datagram(
    buf: &[u8],
    config: &FrameConfig,
) -> Result<(Vec<u8>, PeerId), FrameError> {
    let (payload, trailer) = split_datagram(buf, 2, config)?;
    let id = u16::from_le_bytes([trailer[0], trailer[1]]);
    Ok((payload, PeerId(id)))
}

/// Encode a response-direction datagram (server → client): size-prefixed
/// payload followed by the originating peer's id as a 4-byte trailer.
pub fn encode_response_datagram(
    payload: &[u8],
    sender: PeerId,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let len = payload.len() as u32;
    if len > config.max_payload_size {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    let mut out = Vec::with_capacity(4 + payload.len() + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&u32::from(sender.0).to_le_bytes());
    Ok(out)
}

/// Decode a response-direction datagram. Returns the payload and the peer id
/// read from the 4-byte trailer.
pub fn decode_response_datagram(
    buf: &[u8],
    config: &FrameConfig,
) -> Result<(Vec<u8>, PeerId), FrameError> {
    let (payload, trailer) = split_datagram(buf, 4, config)?;
    let id = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    Ok((payload, PeerId(id as u16)))
}

/// Common datagram parsing: validate the size prefix, then split the buffer
/// into payload and peer-id trailer of `trailer_len` bytes.
fn split_datagram<'a>(
    buf: &'a [u8],
    trailer_len: usize,
    config: &FrameConfig,
) -> Result<(Vec<u8>, &'a [u8]), FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::Truncated);
    }

    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if payload_len > config.max_payload_size {
        return Err(FrameError::FrameTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let total = 4 + payload_len as usize + trailer_len;
    if buf.len() < total {
        return Err(FrameError::Truncated);
    }

    let payload = buf[4..4 + payload_len as usize].to_vec();
    let trailer = &buf[4 + payload_len as usize..total];
    Ok((payload, trailer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::reliable();
        let payload = b"hello world";

        write_frame(&mut client, payload, &config).await.unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_frames_do_not_merge() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::reliable();

        write_frame(&mut client, b"aaa", &config).await.unwrap();
        write_frame(&mut client, b"bbb", &config).await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"aaa");
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"bbb");
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_valid() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::reliable();

        write_frame(&mut client, &[], &config).await.unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected_without_allocation() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        // A hostile prefix claiming 1 GiB. If decode allocated the declared
        // size this test would OOM long before the assertion.
        let fake_len: u32 = 1 << 30;
        client.write_all(&fake_len.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(
            matches!(result, Err(FrameError::FrameTooLarge { size, max: 16 }) if size == 1 << 30),
            "oversized frame must be rejected"
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let result = write_frame(&mut client, &[0u8; 64], &config).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_closed_source_reports_truncated() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let config = FrameConfig::reliable();
        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn test_close_mid_payload_reports_truncated() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::reliable();

        // Declare 100 bytes, deliver 3, then close.
        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[test]
    fn test_request_datagram_roundtrip() {
        let config = FrameConfig::unreliable();
        let buf = encode_request_datagram(b"ping", PeerId(7), &config).unwrap();
        let (payload, sender) = decode_request_datagram(&buf, &config).unwrap();
        assert_eq!(payload, b"ping");
        assert_eq!(sender, PeerId(7));
    }

    #[test]
    fn test_response_datagram_roundtrip() {
        let config = FrameConfig::unreliable();
        let buf = encode_response_datagram(b"pong", PeerId(12), &config).unwrap();
        let (payload, sender) = decode_response_datagram(&buf, &config).unwrap();
        assert_eq!(payload, b"pong");
        assert_eq!(sender, PeerId(12));
    }

    #[test]
    fn test_trailer_widths_are_asymmetric() {
        let config = FrameConfig::unreliable();
        let request = encode_request_datagram(b"x", PeerId(1), &config).unwrap();
        let response = encode_response_datagram(b"x", PeerId(1), &config).unwrap();
        assert_eq!(request.len(), 4 + 1 + 2, "request trailer must be 2 bytes");
        assert_eq!(response.len(), 4 + 1 + 4, "response trailer must be 4 bytes");
    }

    #[test]
    fn test_short_datagram_is_truncated() {
        let config = FrameConfig::unreliable();
        // Declares 10 payload bytes but carries only 2 and no trailer.
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"ab");
        let result = decode_request_datagram(&buf, &config);
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[test]
    fn test_datagram_oversize_rejected() {
        let config = FrameConfig {
            max_payload_size: 8,
        };
        let result = encode_request_datagram(&[0u8; 32], PeerId(1), &config);
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));

        let mut buf = 1_000u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        let result = decode_request_datagram(&buf, &config);
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }
}
