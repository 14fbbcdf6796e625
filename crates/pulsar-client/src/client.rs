//! Client endpoint: connection lifecycle, handshake, keep-alives, and
//! inbound dispatch.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pulsar_config::Config;
use pulsar_proto::{
    CacheMode, CacheScope, ChatScope, CodecError, CompressionKind, FrameConfig, FrameError,
    Packet, PacketTag, PeerId, RoomInfo, RoomOptions, TOKEN_KEY, TargetFilter,
    decode_response_datagram, encode_payload, encode_request_datagram, obfuscate_token,
    read_frame, write_frame,
};
use pulsar_session::{
    IngressItem, IngressSender, LossTracker, NetworkClock, Pipeline, RpcArgs, RpcError,
    RpcHandler, RpcRegistry, RttEstimator, SessionState, Transport, ViewRegistry,
};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::call::{CallBuilder, CallError, CallHeader};

/// How long to wait for the transport connect and each handshake reply.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue depths for outbound payloads and surfaced events.
const SEND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("authentication rejected: {reason}")]
    AuthRejected { reason: String },

    #[error("server refused the connection: {message} (code {code})")]
    Refused { message: String, code: u16 },

    #[error("unexpected handshake reply: {tag}")]
    HandshakeProtocol { tag: PacketTag },

    #[error("session is not connected")]
    NotConnected,

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Observable session state backed by a [`watch`] channel.
pub struct SessionStateWatch {
    tx: watch::Sender<SessionState>,
    rx: watch::Receiver<SessionState>,
}

impl Default for SessionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateWatch {
    /// Create a new watch initialized to [`SessionState::Closed`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(SessionState::Closed);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: SessionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> SessionState {
        *self.rx.borrow()
    }
}

/// Everything the server tells the client that is not a procedure call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChatReceived { sender: PeerId, text: String },
    RoomDirectory(Vec<RoomInfo>),
    GroupJoined { group_id: u32 },
    GroupLeft,
    PeerProperties { sender: PeerId, properties: String },
    CustomReceived { sender: PeerId, body: Vec<u8> },
    StateSync { sender: PeerId, body: Vec<u8> },
    ServerError {
        in_reply_to: PacketTag,
        message: String,
        code: u16,
    },
    Disconnected { reason: String },
}

/// State shared between the client handle and its background tasks.
struct Shared {
    peer_id: PeerId,
    compression: CompressionKind,
    datagram_frames: FrameConfig,
    tcp_tx: mpsc::Sender<Vec<u8>>,
    udp: Arc<UdpSocket>,
    state: Arc<SessionStateWatch>,
    registry: Arc<RpcRegistry>,
    views: Arc<ViewRegistry>,
    events_tx: mpsc::Sender<ClientEvent>,
    shutdown_tx: watch::Sender<bool>,
    clock: Mutex<NetworkClock>,
    rtt: Mutex<RttEstimator>,
    loss: Mutex<LossTracker>,
}

impl Shared {
    async fn send_tcp(&self, packet: &Packet) -> Result<(), ClientError> {
        let payload = encode_payload(packet, self.compression)?;
        self.tcp_tx
            .send(payload)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn send_udp(&self, packet: &Packet) -> Result<(), ClientError> {
        let payload = encode_payload(packet, self.compression)?;
        let datagram =
            encode_request_datagram(&payload, self.peer_id, &self.datagram_frames)?;
        self.udp.send(&datagram).await?;
        self.loss
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_sent();
        Ok(())
    }

    fn emit(&self, event: ClientEvent) {
        if self.events_tx.try_send(event).is_err() {
            warn!("event queue full, dropping event");
        }
    }

    fn local_time_ms(&self) -> f64 {
        self.clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local_time_ms()
    }
}

/// Builds a client: handler registration happens before connect, so the
/// dispatch tables are immutable once traffic flows.
pub struct ClientBuilder {
    registry: RpcRegistry,
    views: ViewRegistry,
    auth_token: Vec<u8>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            registry: RpcRegistry::new(),
            views: ViewRegistry::new(),
            auth_token: Vec::new(),
        }
    }

    /// Register a handler for a session-scoped procedure.
    pub fn register_global<H>(mut self, rpc_id: u8, handler: H) -> Result<Self, RpcError>
    where
        H: RpcHandler + 'static,
    {
        self.registry.register(rpc_id, handler)?;
        Ok(self)
    }

    /// Make a view addressable for instance-bound procedures.
    pub fn add_view(self, view_id: u16) -> Self {
        self.views.add_view(view_id);
        self
    }

    /// Register a handler for an instance-bound procedure. The view must
    /// have been added first.
    pub fn register_instance<H>(
        self,
        view_id: u16,
        rpc_id: u8,
        instance_id: u8,
        handler: H,
    ) -> Result<Self, RpcError>
    where
        H: RpcHandler + 'static,
    {
        self.views.register(view_id, rpc_id, instance_id, handler)?;
        Ok(self)
    }

    /// Opaque credential blob passed to the server's authenticator.
    pub fn auth_token(mut self, token: Vec<u8>) -> Self {
        self.auth_token = token;
        self
    }

    /// Connect, handshake, and start the background tasks.
    pub async fn connect(self, config: &Config) -> Result<PulsarClient, ClientError> {
        PulsarClient::connect_with(self, config).await
    }
}

/// A connected session.
pub struct PulsarClient {
    shared: Arc<Shared>,
    events_rx: mpsc::Receiver<ClientEvent>,
}

impl PulsarClient {
    /// Connect with no handlers registered.
    pub async fn connect(config: &Config) -> Result<Self, ClientError> {
        ClientBuilder::new().connect(config).await
    }

    async fn connect_with(builder: ClientBuilder, config: &Config) -> Result<Self, ClientError> {
        let state = Arc::new(SessionStateWatch::new());
        state.set(SessionState::Connecting);

        let addr: SocketAddr = format!(
            "{}:{}",
            config.transport.address, config.transport.tcp_port
        )
        .parse()
        .map_err(|e| {
            ClientError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        let stream_frames = FrameConfig {
            max_payload_size: config.transport.max_frame_bytes,
        };
        let compression = config.transport.compression;
        let clock = NetworkClock::new();
        let (mut reader, mut writer) = stream.into_split();

        // Handshake runs inline, before any background task exists.
        state.set(SessionState::Handshaking);
        let handshake = Packet::Handshake {
            app_token: obfuscate_token(config.session.app_token.as_bytes(), TOKEN_KEY),
            client_time_ms: clock.local_time_ms(),
            auth_token: builder.auth_token.clone(),
        };
        let payload = encode_payload(&handshake, compression)?;
        write_frame(&mut writer, &payload, &stream_frames).await?;

        let first = read_reply(&mut reader, &stream_frames, compression).await?;
        match first {
            Packet::AuthStatus { approved, reason } => {
                if !approved {
                    state.set(SessionState::Closed);
                    return Err(ClientError::AuthRejected { reason });
                }
            }
            Packet::Error { message, code, .. } => {
                state.set(SessionState::Closed);
                return Err(ClientError::Refused { message, code });
            }
            other => {
                return Err(ClientError::HandshakeProtocol { tag: other.tag() });
            }
        }

        let ack = read_reply(&mut reader, &stream_frames, compression).await?;
        let (peer_id, udp_port, server_time_ms, client_time_ms) = match ack {
            Packet::HandshakeAck {
                server_time_ms,
                client_time_ms,
                udp_port,
                peer_id,
                ..
            } => (peer_id, udp_port, server_time_ms, client_time_ms),
            other => {
                return Err(ClientError::HandshakeProtocol { tag: other.tag() });
            }
        };

        let mut clock = clock;
        clock.record_exchange(client_time_ms, server_time_ms, clock.local_time_ms());

        // Datagram rendezvous: bind, point at the server, and burst
        // keep-alives until the server has our return address.
        let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        udp.connect((addr.ip(), udp_port)).await?;

        let (tcp_tx, tcp_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            peer_id,
            compression,
            datagram_frames: FrameConfig::unreliable(),
            tcp_tx,
            udp: Arc::clone(&udp),
            state: Arc::clone(&state),
            registry: Arc::new(builder.registry),
            views: Arc::new(builder.views),
            events_tx,
            shutdown_tx,
            clock: Mutex::new(clock),
            rtt: Mutex::new(RttEstimator::new()),
            loss: Mutex::new(LossTracker::new(config.session.loss_window_secs)),
        });

        state.set(SessionState::Ready);

        for _ in 0..config.session.rendezvous_burst {
            let probe = Packet::UdpKeepAlive {
                client_time_ms: shared.local_time_ms(),
                sent_count: 0,
                received_count: 0,
            };
            if shared.send_udp(&probe).await.is_err() {
                break;
            }
        }

        let (ingress, pipeline) = Pipeline::new(config.transport.ingress_queue_capacity);

        tokio::spawn(run_writer(tcp_rx, writer, stream_frames.clone()));
        tokio::spawn(run_tcp_reader(
            Arc::clone(&shared),
            reader,
            stream_frames,
            ingress.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_udp_reader(
            Arc::clone(&shared),
            ingress,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_dispatch(
            Arc::clone(&shared),
            pipeline,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_stream_keepalive(
            Arc::clone(&shared),
            Duration::from_secs(config.session.reliable_keepalive_secs),
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_datagram_keepalive(
            Arc::clone(&shared),
            Duration::from_secs(config.session.unreliable_keepalive_secs),
            shutdown_rx,
        ));

        Ok(Self { shared, events_rx })
    }

    /// This session's assigned identity.
    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    /// The observable session state.
    pub fn state(&self) -> &Arc<SessionStateWatch> {
        &self.shared.state
    }

    /// Receive the next event, or `None` after disconnect.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events_rx.recv().await
    }

    /// Smoothed round-trip time, once keep-alives have measured one.
    pub fn rtt_ms(&self) -> Option<f64> {
        self.shared
            .rtt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rtt_ms()
    }

    /// Estimated inbound datagram loss over the current counter window,
    /// from the counters the server's keep-alive acks report. Zero until
    /// acks arrive.
    pub fn loss_ratio(&self) -> f64 {
        self.shared
            .loss
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest_ratio()
    }

    /// Estimated offset from the server clock in milliseconds.
    pub fn clock_offset_ms(&self) -> f64 {
        self.shared
            .clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .offset_ms()
    }

    /// Begin a session-scoped procedure call.
    pub fn begin_global_call(&self, rpc_id: u8, cache: CacheMode) -> CallBuilder {
        CallBuilder::new(CallHeader::Global { rpc_id, cache })
    }

    /// Begin an instance-bound procedure call.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_instance_call(
        &self,
        view_id: u16,
        rpc_id: u8,
        instance_id: u8,
        target: TargetFilter,
        cache: CacheMode,
        transport: Transport,
    ) -> CallBuilder {
        CallBuilder::new(CallHeader::Instance {
            view_id,
            rpc_id,
            instance_id,
            target,
            cache,
            transport,
        })
    }

    /// Send a begun call. The builder is spent afterwards; sending it
    /// again fails with [`CallError::AlreadyFinished`].
    pub async fn end_call(&self, call: &mut CallBuilder) -> Result<(), ClientError> {
        let args = call.take_args()?;
        match call.header {
            CallHeader::Global { rpc_id, cache } => {
                let packet = Packet::GlobalRpc {
                    sender: self.shared.peer_id,
                    cache,
                    rpc_id,
                    args,
                };
                self.shared.send_tcp(&packet).await
            }
            CallHeader::Instance {
                view_id,
                rpc_id,
                instance_id,
                target,
                cache,
                transport,
            } => {
                let packet = Packet::InstanceRpc {
                    sender: self.shared.peer_id,
                    target,
                    cache,
                    view_id,
                    rpc_id,
                    instance_id,
                    args,
                };
                match transport {
                    Transport::Reliable => self.shared.send_tcp(&packet).await,
                    Transport::Unreliable => self.shared.send_udp(&packet).await,
                }
            }
        }
    }

    /// Send a chat line.
    pub async fn chat(&self, scope: ChatScope, text: &str) -> Result<(), ClientError> {
        self.shared
            .send_tcp(&Packet::Chat {
                sender: self.shared.peer_id,
                scope,
                text: text.to_string(),
            })
            .await
    }

    /// Request the room directory; it arrives as
    /// [`ClientEvent::RoomDirectory`].
    pub async fn list_rooms(&self) -> Result<(), ClientError> {
        self.shared.send_tcp(&Packet::GroupList).await
    }

    /// Join a channel or room.
    pub async fn join_group(&self, group_id: u32, password: &str) -> Result<(), ClientError> {
        self.shared
            .send_tcp(&Packet::JoinGroup {
                group_id,
                password: password.to_string(),
            })
            .await
    }

    /// Create a room in the current channel; the join echo arrives as
    /// [`ClientEvent::GroupJoined`] carrying the new room's id.
    pub async fn create_room(&self, options: RoomOptions) -> Result<(), ClientError> {
        self.shared.send_tcp(&Packet::CreateRoom { options }).await
    }

    /// Leave the current room or channel.
    pub async fn leave_group(&self) -> Result<(), ClientError> {
        self.shared.send_tcp(&Packet::LeaveGroup).await
    }

    /// Replace this session's property blob.
    pub async fn set_properties(&self, properties: &str) -> Result<(), ClientError> {
        self.shared
            .send_tcp(&Packet::SetProperties {
                sender: self.shared.peer_id,
                properties: properties.to_string(),
            })
            .await
    }

    /// Relay an opaque application payload within the current group.
    pub async fn send_custom(
        &self,
        target: TargetFilter,
        body: Vec<u8>,
        transport: Transport,
    ) -> Result<(), ClientError> {
        let packet = Packet::Custom {
            sender: self.shared.peer_id,
            target,
            body,
        };
        match transport {
            Transport::Reliable => self.shared.send_tcp(&packet).await,
            Transport::Unreliable => self.shared.send_udp(&packet).await,
        }
    }

    /// Relay a state-synchronization blob to the rest of the group.
    pub async fn synchronize(
        &self,
        body: Vec<u8>,
        transport: Transport,
    ) -> Result<(), ClientError> {
        let packet = Packet::Synchronize {
            sender: self.shared.peer_id,
            body,
        };
        match transport {
            Transport::Reliable => self.shared.send_tcp(&packet).await,
            Transport::Unreliable => self.shared.send_udp(&packet).await,
        }
    }

    /// Ask the server to replay retained calls.
    pub async fn query_cache(
        &self,
        scope: CacheScope,
        id: u8,
        include_own: bool,
    ) -> Result<(), ClientError> {
        self.shared
            .send_tcp(&Packet::CacheQuery {
                scope,
                id,
                include_own,
            })
            .await
    }

    /// Disconnect cleanly: announce `Closing`, tell the server, and let the
    /// stream reader publish `Closed` once the link actually drops.
    pub async fn disconnect(&self, reason: &str) {
        if self.shared.state.current() == SessionState::Ready {
            self.shared.state.set(SessionState::Closing);
        }
        let sent = self
            .shared
            .send_tcp(&Packet::Disconnect {
                reason: reason.to_string(),
            })
            .await;
        if sent.is_err() {
            // The link is already gone; close out here.
            self.shared.state.set(SessionState::Closed);
            let _ = self.shared.shutdown_tx.send(true);
        }
    }
}

/// Read and decode one handshake reply with a timeout.
async fn read_reply(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    frames: &FrameConfig,
    compression: CompressionKind,
) -> Result<Packet, ClientError> {
    let payload = tokio::time::timeout(CONNECT_TIMEOUT, read_frame(reader, frames))
        .await
        .map_err(|_| ClientError::Timeout)??;
    Ok(pulsar_proto::decode_payload(&payload, compression)?)
}

/// Outbound writer: drains encoded payloads onto the stream.
async fn run_writer(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    frames: FrameConfig,
) {
    while let Some(payload) = rx.recv().await {
        if write_frame(&mut writer, &payload, &frames).await.is_err() {
            break;
        }
    }
}

/// Reliable-stream reader: frames in, packets into the pipeline.
async fn run_tcp_reader(
    shared: Arc<Shared>,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    frames: FrameConfig,
    ingress: IngressSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, &frames) => {
                let payload = match result {
                    Ok(payload) => payload,
                    Err(_) => {
                        let state = shared.state.current();
                        if state != SessionState::Closed {
                            shared.state.set(SessionState::Closed);
                            let reason = if state == SessionState::Closing {
                                "disconnect complete"
                            } else {
                                "connection lost"
                            };
                            shared.emit(ClientEvent::Disconnected {
                                reason: reason.to_string(),
                            });
                        }
                        let _ = shared.shutdown_tx.send(true);
                        break;
                    }
                };
                let packet = match pulsar_proto::decode_payload(&payload, shared.compression) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("undecodable payload from server: {e}");
                        continue;
                    }
                };
                let item = IngressItem {
                    peer: shared.peer_id,
                    generation: 0,
                    transport: Transport::Reliable,
                    packet,
                };
                if ingress.submit(item).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Datagram reader. The response trailer names the peer the packet is
/// about, which dispatch passes through to handlers as the sender.
async fn run_udp_reader(
    shared: Arc<Shared>,
    ingress: IngressSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65_536];
    loop {
        tokio::select! {
            result = shared.udp.recv(&mut buf) => {
                let len = match result {
                    Ok(len) => len,
                    Err(e) => {
                        debug!("datagram receive failed: {e}");
                        continue;
                    }
                };
                let (payload, about) =
                    match decode_response_datagram(&buf[..len], &shared.datagram_frames) {
                        Ok(pair) => pair,
                        Err(e) => {
                            trace!("malformed datagram: {e}");
                            continue;
                        }
                    };
                shared
                    .loss
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_received();
                let packet = match pulsar_proto::decode_payload(&payload, shared.compression) {
                    Ok(packet) => packet,
                    Err(e) => {
                        trace!("undecodable datagram: {e}");
                        continue;
                    }
                };
                let item = IngressItem {
                    peer: about,
                    generation: 0,
                    transport: Transport::Unreliable,
                    packet,
                };
                if ingress.submit(item).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// The single inbound dispatch task.
async fn run_dispatch(
    shared: Arc<Shared>,
    mut pipeline: Pipeline,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            item = pipeline.recv() => {
                match item {
                    Some(item) => handle_packet(&shared, item).await,
                    None => break,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn handle_packet(shared: &Arc<Shared>, item: IngressItem) {
    let tag = item.packet.tag();
    if shared.state.current() != SessionState::Ready && !tag.allowed_before_ready() {
        warn!(%tag, "packet ignored, session not ready");
        return;
    }

    match item.packet {
        Packet::GlobalRpc {
            sender,
            rpc_id,
            args,
            ..
        } => {
            let mut rpc_args = RpcArgs::new(sender, &args);
            if let Err(e) = shared.registry.invoke(rpc_id, &mut rpc_args) {
                warn!(rpc_id, "global procedure failed: {e}");
            }
        }

        Packet::InstanceRpc {
            sender,
            view_id,
            rpc_id,
            instance_id,
            args,
            ..
        } => {
            let mut rpc_args = RpcArgs::new(sender, &args);
            if let Err(e) = shared
                .views
                .invoke(view_id, rpc_id, instance_id, &mut rpc_args)
            {
                warn!(view_id, rpc_id, "instance procedure failed: {e}");
            }
        }

        Packet::Chat { sender, text, .. } => {
            shared.emit(ClientEvent::ChatReceived { sender, text });
        }

        Packet::GroupListResponse { rooms } => {
            shared.emit(ClientEvent::RoomDirectory(rooms));
        }

        Packet::JoinGroup { group_id, .. } => {
            shared.emit(ClientEvent::GroupJoined { group_id });
        }

        Packet::LeaveGroup => {
            shared.emit(ClientEvent::GroupLeft);
        }

        Packet::SetProperties { sender, properties } => {
            shared.emit(ClientEvent::PeerProperties { sender, properties });
        }

        Packet::Custom { sender, body, .. } => {
            shared.emit(ClientEvent::CustomReceived { sender, body });
        }

        Packet::Synchronize { sender, body } => {
            shared.emit(ClientEvent::StateSync { sender, body });
        }

        Packet::TcpKeepAlive => {}

        Packet::UdpKeepAliveAck {
            client_time_ms,
            server_time_ms,
            sent_count,
            received_count,
        } => {
            let now = shared.local_time_ms();
            let rtt = now - client_time_ms;
            shared
                .rtt
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_sample(rtt);
            shared
                .clock
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_exchange(client_time_ms, server_time_ms, now);
            let (inbound_loss, outbound_lost) = {
                let mut loss = shared.loss.lock().unwrap_or_else(|e| e.into_inner());
                loss.record_remote_sent(sent_count);
                (
                    loss.latest_ratio(),
                    loss.sent().saturating_sub(received_count),
                )
            };
            trace!(inbound_loss, outbound_lost, "keep-alive ack counters");
        }

        Packet::Disconnect { reason } => {
            if shared.state.current() == SessionState::Ready {
                shared.state.set(SessionState::Closing);
            }
            shared.state.set(SessionState::Closed);
            shared.emit(ClientEvent::Disconnected { reason });
            let _ = shared.shutdown_tx.send(true);
        }

        Packet::Error {
            in_reply_to,
            message,
            code,
        } => {
            shared.emit(ClientEvent::ServerError {
                in_reply_to,
                message,
                code,
            });
        }

        // Connect consumed these; after that they carry nothing new.
        Packet::AuthStatus { .. } | Packet::HandshakeAck { .. } => {}

        other => {
            warn!(tag = %other.tag(), "server sent a client-only packet");
        }
    }
}

/// Periodic liveness probe on the reliable stream.
async fn run_stream_keepalive(
    shared: Arc<Shared>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if shared.send_tcp(&Packet::TcpKeepAlive).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Periodic liveness probe on the datagram path, carrying the counters the
/// server needs for loss accounting.
async fn run_datagram_keepalive(
    shared: Arc<Shared>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let (sent, received) = {
                    let loss = shared.loss.lock().unwrap_or_else(|e| e.into_inner());
                    (loss.sent(), loss.received())
                };
                let probe = Packet::UdpKeepAlive {
                    client_time_ms: shared.local_time_ms(),
                    sent_count: sent,
                    received_count: received,
                };
                if shared.send_udp(&probe).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
