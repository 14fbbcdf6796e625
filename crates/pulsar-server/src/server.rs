//! Server transport plumbing: sockets, per-peer tasks, and teardown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pulsar_config::Config;
use pulsar_proto::{
    CodecError, CompressionKind, FrameConfig, FrameError, Packet, PeerId,
    decode_request_datagram, encode_payload, encode_response_datagram, read_frame, write_frame,
};
use pulsar_session::{
    GroupTable, IngressItem, IngressSender, LossTracker, PacketCache, Peer, PeerIdPool, Pipeline,
    Transport,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Outbound queue depth per peer before relays start waiting.
const PEER_SEND_QUEUE: usize = 64;

/// Errors that can take the server down.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// One connected peer as the server tracks it.
pub(crate) struct PeerEntry {
    pub(crate) peer: Peer,
    /// Stamped on every ingress item this connection produces. Items
    /// carrying an older generation belonged to a previous holder of the
    /// same id and must never reach dispatch.
    pub(crate) generation: u64,
    /// Encoded payloads queued for the peer's stream writer task.
    tx: mpsc::Sender<Vec<u8>>,
    /// Flipped to stop the peer's reader and writer tasks.
    shutdown_tx: watch::Sender<bool>,
    pub(crate) loss: LossTracker,
}

/// Shared server state, reachable from every task.
pub(crate) struct ServerState {
    pub(crate) config: Config,
    pub(crate) compression: CompressionKind,
    pub(crate) stream_frames: FrameConfig,
    pub(crate) datagram_frames: FrameConfig,
    pub(crate) peers: RwLock<HashMap<PeerId, PeerEntry>>,
    pub(crate) id_pool: PeerIdPool,
    pub(crate) groups: std::sync::Mutex<GroupTable>,
    pub(crate) cache: std::sync::Mutex<PacketCache>,
    pub(crate) udp: Arc<UdpSocket>,
    pub(crate) udp_port: u16,
    pub(crate) started: std::time::Instant,
    /// Source of connection generations; every accepted stream gets the
    /// next one.
    generations: AtomicU64,
    ingress: IngressSender,
}

impl ServerState {
    /// Milliseconds since the server started; the timebase echoed to
    /// clients for offset estimation.
    pub(crate) fn time_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Queue a packet for a peer's reliable stream. A missing peer or a
    /// closed queue is not an error; the peer is already on its way out.
    pub(crate) async fn send_tcp(&self, to: PeerId, packet: &Packet) {
        let payload = match encode_payload(packet, self.compression) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%to, "failed to encode outbound packet: {e}");
                return;
            }
        };
        let tx = {
            let peers = self.peers.read().await;
            match peers.get(&to) {
                Some(entry) => entry.tx.clone(),
                None => return,
            }
        };
        if tx.send(payload).await.is_err() {
            trace!(%to, "send queue closed, dropping packet");
        }
    }

    /// Send a packet to a peer's datagram address, tagged with the id of
    /// the peer the packet is about. Suppressed, not failed, while the
    /// target has not yet revealed its datagram address.
    pub(crate) async fn send_udp(&self, to: PeerId, about: PeerId, packet: &Packet) {
        let addr = {
            let peers = self.peers.read().await;
            match peers.get(&to).and_then(|entry| entry.peer.udp_addr) {
                Some(addr) => addr,
                None => {
                    trace!(%to, "datagram address unknown, suppressing send");
                    return;
                }
            }
        };
        let payload = match encode_payload(packet, self.compression) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%to, "failed to encode outbound datagram: {e}");
                return;
            }
        };
        let datagram = match encode_response_datagram(&payload, about, &self.datagram_frames) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(%to, "oversized outbound datagram: {e}");
                return;
            }
        };
        if let Err(e) = self.udp.send_to(&datagram, addr).await {
            debug!(%to, "datagram send failed: {e}");
            return;
        }
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(&to) {
            entry.loss.record_sent();
        }
    }

    /// Every peer currently admitted to full packet flow.
    pub(crate) async fn ready_peers(&self) -> Vec<PeerId> {
        let peers = self.peers.read().await;
        let mut ids: Vec<_> = peers
            .iter()
            .filter(|(_, entry)| entry.peer.is_ready())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Tear a peer down in dependency order: stop its tasks, detach it
    /// from groups, purge its cached packets, drop the table entry, and
    /// only then recycle its id. Packets still queued under this
    /// connection's generation are dropped by dispatch, so a successor
    /// taking the recycled id never inherits them.
    pub(crate) async fn disconnect_peer(&self, id: PeerId, reason: &str) {
        let entry = {
            let mut peers = self.peers.write().await;
            peers.remove(&id)
        };
        let Some(entry) = entry else {
            return; // already torn down
        };
        info!(%id, reason, "peer disconnected");

        let _ = entry.shutdown_tx.send(true);
        {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            groups.remove_peer(id);
        }
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.purge_sender(id);
        }
        self.id_pool.release(id);
    }
}

/// The relay server. Bind it, hand a [`ServerHandle`] to whoever needs to
/// stop it, then run it to completion.
pub struct PulsarServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    pipeline: Option<Pipeline>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// A cloneable remote control for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerHandle {
    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Number of peers currently connected, in any state.
    pub async fn peer_count(&self) -> usize {
        self.state.peers.read().await.len()
    }

    /// Estimated inbound datagram loss for one peer, from the counters its
    /// keep-alives report. Zero until the peer has reported any.
    pub async fn peer_loss_ratio(&self, id: PeerId) -> Option<f64> {
        let peers = self.state.peers.read().await;
        peers.get(&id).map(|entry| entry.loss.latest_ratio())
    }
}

impl PulsarServer {
    /// Bind the stream listener and datagram socket from config.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let tcp_addr: SocketAddr = format!(
            "{}:{}",
            config.transport.address, config.transport.tcp_port
        )
        .parse()
        .map_err(|e| {
            ServerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let udp_addr: SocketAddr = format!(
            "{}:{}",
            config.transport.address, config.transport.udp_port
        )
        .parse()
        .map_err(|e| {
            ServerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let listener = TcpListener::bind(tcp_addr).await?;
        let udp = Arc::new(bind_udp(udp_addr)?);
        let udp_port = udp.local_addr()?.port();

        let (ingress, pipeline) = Pipeline::new(config.transport.ingress_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut groups = GroupTable::new();
        for channel in &config.session.channels {
            groups.add_channel(channel.id, &channel.name, channel.max_peers);
        }

        let state = Arc::new(ServerState {
            compression: config.transport.compression,
            stream_frames: FrameConfig {
                max_payload_size: config.transport.max_frame_bytes,
            },
            datagram_frames: FrameConfig::unreliable(),
            peers: RwLock::new(HashMap::new()),
            id_pool: PeerIdPool::new(config.session.max_peers),
            groups: std::sync::Mutex::new(groups),
            cache: std::sync::Mutex::new(PacketCache::new(config.session.append_cache_cap)),
            udp,
            udp_port,
            started: std::time::Instant::now(),
            generations: AtomicU64::new(0),
            ingress,
            config,
        });

        Ok(Self {
            listener,
            state,
            pipeline: Some(pipeline),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The bound stream address, useful when the config asked for port 0.
    pub fn tcp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// The bound datagram address.
    pub fn udp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.state.udp.local_addr()?)
    }

    /// A remote control for this server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the accept loop, datagram loop, dispatch task, and staleness
    /// sweep until shutdown is signalled, then tear every peer down.
    pub async fn run(mut self) -> Result<(), ServerError> {
        info!(
            tcp = %self.listener.local_addr()?,
            udp = %self.state.udp.local_addr()?,
            "server listening"
        );

        let pipeline = self
            .pipeline
            .take()
            .ok_or_else(|| {
                ServerError::Io(std::io::Error::other("server already running"))
            })?;

        let dispatch = tokio::spawn(run_dispatch(
            Arc::clone(&self.state),
            pipeline,
            self.shutdown_rx.clone(),
        ));
        let datagrams = tokio::spawn(run_udp(
            Arc::clone(&self.state),
            self.shutdown_rx.clone(),
        ));
        let sweep = tokio::spawn(run_sweep(
            Arc::clone(&self.state),
            self.shutdown_rx.clone(),
        ));

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, peer_addr) = result?;
                    accept_peer(Arc::clone(&self.state), stream, peer_addr).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("server shutting down");
                        break;
                    }
                }
            }
        }

        // Grace period for in-flight dispatch before tearing peers down.
        tokio::time::sleep(std::time::Duration::from_millis(
            self.state.config.session.shutdown_grace_ms,
        ))
        .await;

        let ids: Vec<_> = {
            let peers = self.state.peers.read().await;
            peers.keys().copied().collect()
        };
        for id in ids {
            self.state
                .send_tcp(
                    id,
                    &Packet::Disconnect {
                        reason: "server stopping".to_string(),
                    },
                )
                .await;
            self.state.disconnect_peer(id, "server stopping").await;
        }

        dispatch.abort();
        datagrams.abort();
        sweep.abort();
        Ok(())
    }
}

/// Bind the datagram socket with enlarged buffers; relay fan-out is bursty.
fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, ServerError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(1 << 20)?;
    socket.set_send_buffer_size(1 << 20)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Admit a new stream connection: assign an id, start its writer and
/// reader tasks, and record it as `Connecting`.
async fn accept_peer(state: Arc<ServerState>, stream: TcpStream, peer_addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set nodelay for {peer_addr}: {e}");
    }

    let id = match state.id_pool.acquire() {
        Ok(id) => id,
        Err(e) => {
            warn!("rejecting {peer_addr}: {e}");
            let mut stream = stream;
            let reject = Packet::Error {
                in_reply_to: pulsar_proto::PacketTag::Handshake,
                message: "server full".to_string(),
                code: 503,
            };
            if let Ok(payload) = encode_payload(&reject, state.compression) {
                let _ = write_frame(&mut stream, &payload, &state.stream_frames).await;
            }
            return;
        }
    };

    info!(%id, "accepted connection from {peer_addr}");

    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PEER_SEND_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let generation = state.generations.fetch_add(1, Ordering::Relaxed) + 1;
    let entry = PeerEntry {
        peer: Peer::new(id, peer_addr),
        generation,
        tx,
        shutdown_tx,
        loss: LossTracker::new(state.config.session.loss_window_secs),
    };
    state.peers.write().await.insert(id, entry);

    let frames = state.stream_frames.clone();
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if write_frame(&mut writer, &payload, &frames).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(run_peer_reader(state, id, generation, reader, shutdown_rx));
}

/// Per-peer stream reader: frames in, decoded packets into the pipeline.
async fn run_peer_reader(
    state: Arc<ServerState>,
    id: PeerId,
    generation: u64,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let frames = state.stream_frames.clone();
    let reason = loop {
        tokio::select! {
            result = read_frame(&mut reader, &frames) => {
                let payload = match result {
                    Ok(payload) => payload,
                    Err(FrameError::Truncated) => break "connection closed",
                    Err(e) => {
                        warn!(%id, "stream read failed: {e}");
                        break "read error";
                    }
                };
                let packet = match pulsar_proto::decode_payload(&payload, state.compression) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(%id, "undecodable payload: {e}");
                        break "bad payload";
                    }
                };
                let item = IngressItem {
                    peer: id,
                    generation,
                    transport: Transport::Reliable,
                    packet,
                };
                if state.ingress.submit(item).await.is_err() {
                    break "server stopping";
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return; // teardown already underway elsewhere
                }
            }
        }
    };
    state.disconnect_peer(id, reason).await;
}

/// The single dispatch task: drains the ingress pipeline in order.
async fn run_dispatch(
    state: Arc<ServerState>,
    mut pipeline: Pipeline,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            item = pipeline.recv() => {
                match item {
                    Some(item) => state.handle_item(item).await,
                    None => break,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("dispatch task stopping");
                    break;
                }
            }
        }
    }
}

/// The datagram receive loop. The first datagram from a peer records its
/// return address; until then the server never sends that peer datagrams.
async fn run_udp(state: Arc<ServerState>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        tokio::select! {
            result = state.udp.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!("datagram receive failed: {e}");
                        continue;
                    }
                };
                let (payload, id) =
                    match decode_request_datagram(&buf[..len], &state.datagram_frames) {
                        Ok(pair) => pair,
                        Err(e) => {
                            trace!("malformed datagram from {from}: {e}");
                            continue;
                        }
                    };

                let generation = {
                    let mut peers = state.peers.write().await;
                    let Some(entry) = peers.get_mut(&id) else {
                        trace!(%id, "datagram for unknown peer from {from}");
                        continue;
                    };
                    if entry.peer.udp_addr != Some(from) {
                        debug!(%id, "datagram address recorded: {from}");
                        entry.peer.udp_addr = Some(from);
                    }
                    entry.loss.record_received();
                    entry.generation
                };

                let packet = match pulsar_proto::decode_payload(&payload, state.compression) {
                    Ok(packet) => packet,
                    Err(e) => {
                        trace!(%id, "undecodable datagram: {e}");
                        continue;
                    }
                };
                let item = IngressItem {
                    peer: id,
                    generation,
                    transport: Transport::Unreliable,
                    packet,
                };
                if state.ingress.submit(item).await.is_err() {
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

/// Periodic staleness sweep: peers silent past the activity timeout are
/// disconnected.
async fn run_sweep(state: Arc<ServerState>, mut shutdown_rx: watch::Receiver<bool>) {
    let timeout = std::time::Duration::from_secs(state.config.session.activity_timeout_secs);
    let period = std::cmp::max(timeout / 3, std::time::Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let stale: Vec<_> = {
                    let peers = state.peers.read().await;
                    peers
                        .iter()
                        .filter(|(_, entry)| entry.peer.is_stale(timeout))
                        .map(|(id, _)| *id)
                        .collect()
                };
                for id in stale {
                    state.disconnect_peer(id, "timed out").await;
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
