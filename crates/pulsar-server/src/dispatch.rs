//! Packet dispatch: one inbound packet in, session mutations and relays
//! out. Runs on the single dispatch task, so handlers here never race
//! with each other.

use pulsar_proto::{
    CacheMode, ChatScope, Packet, PacketTag, PeerId, TOKEN_KEY, TargetFilter, obfuscate_token,
};
use pulsar_session::{GroupError, IngressItem, SessionState, Transport};
use tracing::{debug, info, trace, warn};

use crate::server::ServerState;

const CODE_BAD_REQUEST: u16 = 400;
const CODE_UNAUTHENTICATED: u16 = 401;
const CODE_WRONG_PASSWORD: u16 = 403;
const CODE_NOT_FOUND: u16 = 404;
const CODE_CONFLICT: u16 = 409;
const CODE_FULL: u16 = 503;

impl ServerState {
    /// Handle one packet from the ingress pipeline.
    pub(crate) async fn handle_item(&self, item: IngressItem) {
        let IngressItem {
            peer: from,
            generation,
            transport,
            packet,
        } = item;
        let tag = packet.tag();

        // Refresh activity and run the admission gate in one lock pass.
        let gate = {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_mut(&from) else {
                return; // disconnected while queued
            };
            if entry.generation != generation {
                // Queued by a previous holder of a recycled id.
                debug!(%from, %tag, "dropping stale ingress from an earlier connection");
                return;
            }
            entry.peer.touch();
            if tag.allowed_before_ready() {
                Ok(())
            } else {
                entry.peer.require_ready()
            }
        };
        if let Err(e) = gate {
            warn!(%from, %tag, "packet rejected at admission gate: {e}");
            self.send_tcp(
                from,
                &Packet::Error {
                    in_reply_to: tag,
                    message: "session not ready".to_string(),
                    code: CODE_UNAUTHENTICATED,
                },
            )
            .await;
            return;
        }

        match packet {
            Packet::Handshake {
                app_token,
                client_time_ms,
                auth_token,
            } => {
                self.handle_handshake(from, app_token, client_time_ms, auth_token)
                    .await;
            }

            Packet::TcpKeepAlive => {} // touch above is the whole effect

            Packet::UdpKeepAlive {
                client_time_ms,
                sent_count,
                received_count,
            } => {
                let (sent, received) = {
                    let mut peers = self.peers.write().await;
                    match peers.get_mut(&from) {
                        Some(entry) => {
                            entry.loss.record_remote_sent(sent_count);
                            let outbound_lost =
                                entry.loss.sent().saturating_sub(received_count);
                            trace!(
                                %from,
                                inbound_loss = entry.loss.latest_ratio(),
                                outbound_lost,
                                "keep-alive counters updated"
                            );
                            (entry.loss.sent(), entry.loss.received())
                        }
                        None => return,
                    }
                };
                self.send_udp(
                    from,
                    from,
                    &Packet::UdpKeepAliveAck {
                        client_time_ms,
                        server_time_ms: self.time_ms(),
                        sent_count: sent,
                        received_count: received,
                    },
                )
                .await;
            }

            Packet::Disconnect { reason } => {
                self.disconnect_peer(from, &reason).await;
            }

            Packet::Chat { scope, text, .. } => {
                // Sender identity always comes from the connection.
                let packet = Packet::Chat {
                    sender: from,
                    scope,
                    text,
                };
                match scope {
                    ChatScope::Global => {
                        for id in self.ready_peers().await {
                            self.send_tcp(id, &packet).await;
                        }
                    }
                    ChatScope::Private(target) => {
                        if self.peer_is_ready(target).await {
                            self.send_tcp(target, &packet).await;
                        } else {
                            self.reply_error(from, tag, "no such peer", CODE_NOT_FOUND)
                                .await;
                        }
                    }
                }
            }

            Packet::InstanceRpc {
                target,
                cache,
                view_id,
                rpc_id,
                instance_id,
                args,
                ..
            } => {
                let packet = Packet::InstanceRpc {
                    sender: from,
                    target,
                    cache,
                    view_id,
                    rpc_id,
                    instance_id,
                    args,
                };
                self.retain(&packet, cache);
                self.relay(from, target, transport, &packet).await;
            }

            Packet::GlobalRpc {
                cache,
                rpc_id,
                args,
                ..
            } => {
                let packet = Packet::GlobalRpc {
                    sender: from,
                    cache,
                    rpc_id,
                    args,
                };
                self.retain(&packet, cache);
                self.relay(from, TargetFilter::All, transport, &packet).await;
            }

            Packet::GroupList => {
                let rooms = {
                    let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
                    groups.list_rooms()
                };
                self.send_tcp(from, &Packet::GroupListResponse { rooms })
                    .await;
            }

            Packet::JoinGroup { group_id, password } => {
                let result = {
                    let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
                    groups.join(from, group_id, &password)
                };
                match result {
                    Ok(()) => {
                        debug!(%from, group_id, "joined group");
                        self.send_tcp(
                            from,
                            &Packet::JoinGroup {
                                group_id,
                                password: String::new(),
                            },
                        )
                        .await;
                    }
                    Err(e) => self.reply_group_error(from, tag, e).await,
                }
            }

            Packet::CreateRoom { options } => {
                let result = {
                    let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
                    groups.create_room(from, options)
                };
                match result {
                    Ok(room_id) => {
                        info!(%from, room_id, "room created");
                        // The join echo carries the new room's id.
                        self.send_tcp(
                            from,
                            &Packet::JoinGroup {
                                group_id: room_id,
                                password: String::new(),
                            },
                        )
                        .await;
                    }
                    Err(e) => self.reply_group_error(from, tag, e).await,
                }
            }

            Packet::LeaveGroup => {
                let result = {
                    let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
                    groups.leave(from)
                };
                match result {
                    Ok(()) => self.send_tcp(from, &Packet::LeaveGroup).await,
                    Err(e) => self.reply_group_error(from, tag, e).await,
                }
            }

            Packet::SetProperties { properties, .. } => {
                {
                    let mut peers = self.peers.write().await;
                    if let Some(entry) = peers.get_mut(&from) {
                        entry.peer.properties = properties.clone();
                    }
                }
                let packet = Packet::SetProperties {
                    sender: from,
                    properties,
                };
                self.relay(from, TargetFilter::All, transport, &packet).await;
            }

            Packet::Custom { target, body, .. } => {
                let packet = Packet::Custom {
                    sender: from,
                    target,
                    body,
                };
                self.relay(from, target, transport, &packet).await;
            }

            Packet::Synchronize { body, .. } => {
                let packet = Packet::Synchronize { sender: from, body };
                self.relay(from, TargetFilter::Others, transport, &packet)
                    .await;
            }

            Packet::CacheQuery {
                scope,
                id,
                include_own,
            } => {
                let replay = {
                    let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                    cache.query(scope, id, include_own, from)
                };
                debug!(%from, count = replay.len(), "replaying cached packets");
                for cached in replay {
                    self.send_tcp(from, &cached.packet).await;
                }
            }

            // Server-bound directions of these packets do not exist.
            Packet::HandshakeAck { .. }
            | Packet::AuthStatus { .. }
            | Packet::UdpKeepAliveAck { .. }
            | Packet::GroupListResponse { .. }
            | Packet::Error { .. } => {
                warn!(%from, %tag, "client sent a server-only packet");
                self.reply_error(from, tag, "unexpected packet", CODE_BAD_REQUEST)
                    .await;
            }
        }
    }

    async fn handle_handshake(
        &self,
        from: PeerId,
        app_token: Vec<u8>,
        client_time_ms: f64,
        auth_token: Vec<u8>,
    ) {
        // Credential blob is opaque to the transport; an authenticator
        // would inspect it here.
        let _ = auth_token;

        let token = obfuscate_token(&app_token, TOKEN_KEY);
        if token != self.config.session.app_token.as_bytes() {
            warn!(%from, "handshake with invalid application token");
            self.send_tcp(
                from,
                &Packet::AuthStatus {
                    approved: false,
                    reason: "invalid application token".to_string(),
                },
            )
            .await;
            self.disconnect_peer(from, "invalid application token").await;
            return;
        }

        let (peer_name, transitioned) = {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_mut(&from) else {
                return;
            };
            let ok = entry.peer.transition_to(SessionState::Handshaking).is_ok()
                && entry.peer.transition_to(SessionState::Ready).is_ok();
            (entry.peer.name.clone(), ok)
        };
        if !transitioned {
            self.reply_error(from, PacketTag::Handshake, "handshake already completed", CODE_CONFLICT)
                .await;
            return;
        }

        info!(%from, "peer admitted");
        self.send_tcp(
            from,
            &Packet::AuthStatus {
                approved: true,
                reason: String::new(),
            },
        )
        .await;
        self.send_tcp(
            from,
            &Packet::HandshakeAck {
                server_time_ms: self.time_ms(),
                client_time_ms,
                udp_port: self.udp_port,
                peer_id: from,
                peer_name,
            },
        )
        .await;
    }

    /// Retain a relayed call per its cache mode.
    fn retain(&self, packet: &Packet, mode: CacheMode) {
        if mode == CacheMode::None {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = cache.store(packet) {
            warn!("cache store failed: {e}");
        }
    }

    /// Relay a packet within the sender's scope: its group if it has one,
    /// otherwise every ready peer. The reply rides the transport the
    /// original arrived on.
    async fn relay(&self, from: PeerId, target: TargetFilter, transport: Transport, packet: &Packet) {
        let mut scope = {
            let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            groups.members_with(from)
        };
        if scope.is_empty() {
            scope = self.ready_peers().await;
        }

        for id in scope {
            let send = match target {
                TargetFilter::All => true,
                TargetFilter::Others => id != from,
                TargetFilter::Owner => id == from,
            };
            if !send {
                continue;
            }
            match transport {
                Transport::Reliable => self.send_tcp(id, packet).await,
                Transport::Unreliable => self.send_udp(id, from, packet).await,
            }
        }
    }

    async fn peer_is_ready(&self, id: PeerId) -> bool {
        let peers = self.peers.read().await;
        peers.get(&id).is_some_and(|entry| entry.peer.is_ready())
    }

    async fn reply_error(&self, to: PeerId, in_reply_to: PacketTag, message: &str, code: u16) {
        self.send_tcp(
            to,
            &Packet::Error {
                in_reply_to,
                message: message.to_string(),
                code,
            },
        )
        .await;
    }

    async fn reply_group_error(&self, to: PeerId, in_reply_to: PacketTag, error: GroupError) {
        let code = match &error {
            GroupError::NotFound { .. } => CODE_NOT_FOUND,
            GroupError::Full { .. } => CODE_FULL,
            GroupError::Closed { .. } => CODE_FULL,
            GroupError::AlreadyMember { .. } => CODE_CONFLICT,
            GroupError::WrongPassword { .. } => CODE_WRONG_PASSWORD,
            GroupError::NotAMember { .. } => CODE_BAD_REQUEST,
            GroupError::NotInChannel { .. } => CODE_BAD_REQUEST,
        };
        debug!(%to, "group operation failed: {error}");
        self.reply_error(to, in_reply_to, &error.to_string(), code)
            .await;
    }
}
