//! The packet vocabulary shared by client and server.
//!
//! Packets are serialized with postcard behind a protocol version byte, so
//! incompatible builds fail loudly at decode time instead of misreading
//! fields. The first thing either side inspects on a decoded packet is its
//! [`PacketTag`], which drives dispatch and the pre-ready gate.

use serde::{Deserialize, Serialize};

/// Protocol version. Bump on any change to the packet vocabulary.
pub const PROTOCOL_VERSION: u8 = 1;

/// Keystream both endpoints apply to the application token in the
/// handshake. See [`obfuscate_token`].
pub const TOKEN_KEY: &[u8] = b"pulsar-handshake";

/// A connected peer's session-scoped identity. Ids live in
/// `[1, max_peers]` and are recycled after disconnect; 0 is never a valid
/// assigned id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerId(pub u16);

impl PeerId {
    /// The unassigned sentinel, used by a client before its handshake
    /// acknowledgement arrives.
    pub const UNASSIGNED: PeerId = PeerId(0);
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Who receives a relayed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetFilter {
    /// Everyone in scope, including the sender.
    All,
    /// Everyone in scope except the sender.
    Others,
    /// Only back to the sender.
    Owner,
}

/// How a relayed packet is retained for peers that join later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Not retained.
    None,
    /// One retained slot per (sender, rpc identity); each send replaces the
    /// previous entry.
    Overwrite,
    /// Every send is appended, up to the configured cap.
    Append,
}

/// Which cached packets a late joiner asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheScope {
    /// All cached packets regardless of kind.
    All,
    /// Cached global procedure calls with the given procedure id.
    Global,
    /// Cached instance procedure calls with the given procedure id.
    Instance,
}

/// Visibility of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatScope {
    /// Everyone connected.
    Global,
    /// A single recipient.
    Private(PeerId),
}

/// Discriminant-only view of a [`Packet`], used for dispatch decisions and
/// log fields without borrowing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketTag {
    Handshake,
    HandshakeAck,
    AuthStatus,
    TcpKeepAlive,
    UdpKeepAlive,
    UdpKeepAliveAck,
    Disconnect,
    Chat,
    InstanceRpc,
    GlobalRpc,
    GroupList,
    GroupListResponse,
    JoinGroup,
    CreateRoom,
    LeaveGroup,
    SetProperties,
    Custom,
    Synchronize,
    CacheQuery,
    Error,
}

impl PacketTag {
    /// Whether a packet of this kind may be processed before the session
    /// reaches the ready state. Everything else is rejected at the gate.
    pub fn allowed_before_ready(self) -> bool {
        matches!(
            self,
            PacketTag::Handshake
                | PacketTag::HandshakeAck
                | PacketTag::AuthStatus
                | PacketTag::Disconnect
                | PacketTag::Error
        )
    }
}

impl std::fmt::Display for PacketTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Everything that crosses the wire between client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// First packet on a new connection. Carries the obfuscated application
    /// token, the client's clock for offset estimation, and an opaque
    /// credential blob for the server's authenticator.
    Handshake {
        app_token: Vec<u8>,
        client_time_ms: f64,
        auth_token: Vec<u8>,
    },

    /// Server's reply to a valid handshake. Echoes the client's clock so it
    /// can estimate offset, and tells the client its assigned identity and
    /// where to send datagrams.
    HandshakeAck {
        server_time_ms: f64,
        client_time_ms: f64,
        udp_port: u16,
        peer_id: PeerId,
        peer_name: String,
    },

    /// Authentication verdict, sent before or instead of the ack.
    AuthStatus { approved: bool, reason: String },

    /// Liveness probe on the reliable stream. Carries no measurement; its
    /// arrival alone refreshes the peer's activity clock.
    TcpKeepAlive,

    /// Liveness probe on the datagram transport. Carries the counters both
    /// sides need for RTT and loss estimation.
    UdpKeepAlive {
        client_time_ms: f64,
        sent_count: u32,
        received_count: u32,
    },

    /// Server's echo of a datagram probe.
    UdpKeepAliveAck {
        client_time_ms: f64,
        server_time_ms: f64,
        sent_count: u32,
        received_count: u32,
    },

    /// Orderly teardown notice, valid in either direction.
    Disconnect { reason: String },

    /// A chat line, relayed by the server within the given scope.
    Chat {
        sender: PeerId,
        scope: ChatScope,
        text: String,
    },

    /// A procedure call bound to a replicated object instance.
    InstanceRpc {
        sender: PeerId,
        target: TargetFilter,
        cache: CacheMode,
        view_id: u16,
        rpc_id: u8,
        instance_id: u8,
        args: Vec<u8>,
    },

    /// A procedure call bound to no particular instance.
    GlobalRpc {
        sender: PeerId,
        cache: CacheMode,
        rpc_id: u8,
        args: Vec<u8>,
    },

    /// Client request for the room directory.
    GroupList,

    /// Server's room directory reply.
    GroupListResponse { rooms: Vec<RoomInfo> },

    /// Join an existing channel or room by id.
    JoinGroup {
        group_id: u32,
        password: String,
    },

    /// Create a room inside the sender's current channel.
    CreateRoom { options: RoomOptions },

    /// Leave the sender's current room or channel.
    LeaveGroup,

    /// Replace the sender's session properties, broadcast to its group.
    SetProperties { sender: PeerId, properties: String },

    /// Application-defined payload, relayed opaquely within the sender's
    /// group.
    Custom {
        sender: PeerId,
        target: TargetFilter,
        body: Vec<u8>,
    },

    /// State-synchronization blob, relayed within the sender's group.
    Synchronize { sender: PeerId, body: Vec<u8> },

    /// Late-joiner request to replay cached packets.
    CacheQuery {
        scope: CacheScope,
        id: u8,
        include_own: bool,
    },

    /// Server-reported failure, tied to the packet kind that caused it.
    Error {
        in_reply_to: PacketTag,
        message: String,
        code: u16,
    },
}

/// Room metadata as reported in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub group_id: u32,
    pub name: String,
    pub peer_count: u16,
    pub max_peers: u16,
    pub has_password: bool,
    pub visible: bool,
    /// The opaque property blob the owner set at creation.
    pub properties: String,
}

/// Parameters for a new room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomOptions {
    pub name: String,
    pub max_peers: u16,
    pub password: String,
    pub visible: bool,
    pub properties: String,
}

impl Packet {
    /// This packet's discriminant tag.
    pub fn tag(&self) -> PacketTag {
        match self {
            Packet::Handshake { .. } => PacketTag::Handshake,
            Packet::HandshakeAck { .. } => PacketTag::HandshakeAck,
            Packet::AuthStatus { .. } => PacketTag::AuthStatus,
            Packet::TcpKeepAlive => PacketTag::TcpKeepAlive,
            Packet::UdpKeepAlive { .. } => PacketTag::UdpKeepAlive,
            Packet::UdpKeepAliveAck { .. } => PacketTag::UdpKeepAliveAck,
            Packet::Disconnect { .. } => PacketTag::Disconnect,
            Packet::Chat { .. } => PacketTag::Chat,
            Packet::InstanceRpc { .. } => PacketTag::InstanceRpc,
            Packet::GlobalRpc { .. } => PacketTag::GlobalRpc,
            Packet::GroupList => PacketTag::GroupList,
            Packet::GroupListResponse { .. } => PacketTag::GroupListResponse,
            Packet::JoinGroup { .. } => PacketTag::JoinGroup,
            Packet::CreateRoom { .. } => PacketTag::CreateRoom,
            Packet::LeaveGroup => PacketTag::LeaveGroup,
            Packet::SetProperties { .. } => PacketTag::SetProperties,
            Packet::Custom { .. } => PacketTag::Custom,
            Packet::Synchronize { .. } => PacketTag::Synchronize,
            Packet::CacheQuery { .. } => PacketTag::CacheQuery,
            Packet::Error { .. } => PacketTag::Error,
        }
    }
}

/// Errors raised while turning packets into bytes and back.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// Postcard failed to encode or decode the packet body.
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// The version byte did not match this build's protocol version.
    #[error("protocol version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u8, expected: u8 },

    /// The buffer was empty or ended before the packet body.
    #[error("packet truncated")]
    Truncated,
}

/// Serialize a packet: one protocol version byte followed by the postcard
/// encoding.
pub fn serialize_packet(packet: &Packet) -> Result<Vec<u8>, PacketError> {
    let mut buf = vec![PROTOCOL_VERSION];
    let body = postcard::to_allocvec(packet)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Deserialize a packet, checking the version byte first.
pub fn deserialize_packet(buf: &[u8]) -> Result<Packet, PacketError> {
    let (&version, body) = buf.split_first().ok_or(PacketError::Truncated)?;
    if version != PROTOCOL_VERSION {
        return Err(PacketError::VersionMismatch {
            got: version,
            expected: PROTOCOL_VERSION,
        });
    }
    Ok(postcard::from_bytes(body)?)
}

/// Obfuscate (or restore) an application token with a repeating XOR
/// keystream derived from the key. Symmetric: applying it twice with the
/// same key restores the input. This is obfuscation, not encryption.
pub fn obfuscate_token(token: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return token.to_vec();
    }
    token
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()] ^ (i as u8).wrapping_mul(31))
        .collect()
}
