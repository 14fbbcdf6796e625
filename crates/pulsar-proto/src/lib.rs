//! Wire protocol for the Pulsar transport: length-prefixed framing,
//! payload compression, and the packet vocabulary shared by client and
//! server. This crate knows nothing about sockets or sessions — it turns
//! packets into bytes and back.

pub mod codec;
pub mod compress;
pub mod framing;
pub mod packet;

pub use codec::{CodecError, decode_payload, encode_payload};
pub use compress::{CompressionError, CompressionKind, compress, decompress};
pub use framing::{
    FrameConfig, FrameError, decode_request_datagram, decode_response_datagram,
    encode_request_datagram, encode_response_datagram, read_frame, write_frame,
};
pub use packet::{
    CacheMode, CacheScope, ChatScope, PROTOCOL_VERSION, Packet, PacketError, PacketTag, PeerId,
    RoomInfo, RoomOptions, TOKEN_KEY, TargetFilter, deserialize_packet, obfuscate_token,
    serialize_packet,
};
