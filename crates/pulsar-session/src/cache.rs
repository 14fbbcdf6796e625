//! Retention of relayed procedure calls for late joiners.
//!
//! A call sent with a cache mode other than `None` is retained here and
//! replayed to peers that ask for it after joining. `Overwrite` keeps one
//! slot per (sender, call identity) that each new send replaces;
//! `Append` keeps every send in arrival order up to a cap, evicting the
//! oldest entry once the cap is reached.

use std::collections::{BTreeMap, VecDeque};

use pulsar_proto::{CacheMode, CacheScope, Packet, PacketTag, PeerId};

/// Identity of a cacheable call, used as the overwrite slot key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CacheKey {
    Global {
        rpc_id: u8,
    },
    Instance {
        view_id: u16,
        rpc_id: u8,
        instance_id: u8,
    },
}

/// One retained call.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPacket {
    /// Who originally sent it.
    pub sender: PeerId,
    /// The call as it went over the wire.
    pub packet: Packet,
}

/// Errors raised by the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The packet kind carries no cache mode and cannot be retained.
    #[error("packet kind {tag} is not cacheable")]
    NotCacheable { tag: PacketTag },
}

/// The server-side retention store.
pub struct PacketCache {
    overwrite: BTreeMap<(PeerId, CacheKey), Packet>,
    append: VecDeque<CachedPacket>,
    append_cap: usize,
}

impl PacketCache {
    pub fn new(append_cap: usize) -> Self {
        Self {
            overwrite: BTreeMap::new(),
            append: VecDeque::new(),
            append_cap,
        }
    }

    /// Retain a call according to its embedded cache mode. `None`-mode
    /// calls pass through without being stored.
    pub fn store(&mut self, packet: &Packet) -> Result<(), CacheError> {
        let (sender, mode, key) = match packet {
            Packet::GlobalRpc {
                sender,
                cache,
                rpc_id,
                ..
            } => (*sender, *cache, CacheKey::Global { rpc_id: *rpc_id }),
            Packet::InstanceRpc {
                sender,
                cache,
                view_id,
                rpc_id,
                instance_id,
                ..
            } => (
                *sender,
                *cache,
                CacheKey::Instance {
                    view_id: *view_id,
                    rpc_id: *rpc_id,
                    instance_id: *instance_id,
                },
            ),
            other => {
                return Err(CacheError::NotCacheable { tag: other.tag() });
            }
        };

        match mode {
            CacheMode::None => {}
            CacheMode::Overwrite => {
                self.overwrite.insert((sender, key), packet.clone());
            }
            CacheMode::Append => {
                if self.append.len() == self.append_cap {
                    self.append.pop_front();
                }
                self.append.push_back(CachedPacket {
                    sender,
                    packet: packet.clone(),
                });
            }
        }
        Ok(())
    }

    /// Collect the retained calls matching a replay request. Overwrite
    /// slots come first in stable key order, then appended calls in
    /// arrival order. `include_own` controls whether the requester's own
    /// sends are replayed back to it.
    pub fn query(
        &self,
        scope: CacheScope,
        id: u8,
        include_own: bool,
        requester: PeerId,
    ) -> Vec<CachedPacket> {
        let matches_scope = |packet: &Packet| match (scope, packet) {
            (CacheScope::All, _) => true,
            (CacheScope::Global, Packet::GlobalRpc { rpc_id, .. }) => *rpc_id == id,
            (CacheScope::Instance, Packet::InstanceRpc { rpc_id, .. }) => *rpc_id == id,
            _ => false,
        };

        let mut out = Vec::new();
        for ((sender, _key), packet) in &self.overwrite {
            if (*sender != requester || include_own) && matches_scope(packet) {
                out.push(CachedPacket {
                    sender: *sender,
                    packet: packet.clone(),
                });
            }
        }
        for cached in &self.append {
            if (cached.sender != requester || include_own) && matches_scope(&cached.packet) {
                out.push(cached.clone());
            }
        }
        out
    }

    /// Drop everything a departing peer contributed.
    pub fn purge_sender(&mut self, peer: PeerId) {
        self.overwrite.retain(|(sender, _), _| *sender != peer);
        self.append.retain(|cached| cached.sender != peer);
    }

    /// Total retained entries across both stores.
    pub fn len(&self) -> usize {
        self.overwrite.len() + self.append.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global_call(sender: u16, cache: CacheMode, rpc_id: u8, args: &[u8]) -> Packet {
        Packet::GlobalRpc {
            sender: PeerId(sender),
            cache,
            rpc_id,
            args: args.to_vec(),
        }
    }

    #[test]
    fn test_overwrite_keeps_only_the_latest_send() {
        let mut cache = PacketCache::new(512);
        cache
            .store(&global_call(1, CacheMode::Overwrite, 3, b"first"))
            .unwrap();
        cache
            .store(&global_call(1, CacheMode::Overwrite, 3, b"second"))
            .unwrap();

        let replay = cache.query(CacheScope::Global, 3, true, PeerId(9));
        assert_eq!(replay.len(), 1);
        assert_eq!(
            replay[0].packet,
            global_call(1, CacheMode::Overwrite, 3, b"second")
        );
    }

    #[test]
    fn test_overwrite_slots_are_per_sender() {
        let mut cache = PacketCache::new(512);
        cache
            .store(&global_call(1, CacheMode::Overwrite, 3, b"a"))
            .unwrap();
        cache
            .store(&global_call(2, CacheMode::Overwrite, 3, b"b"))
            .unwrap();
        let replay = cache.query(CacheScope::Global, 3, true, PeerId(9));
        assert_eq!(replay.len(), 2);
    }

    #[test]
    fn test_append_retains_every_send_in_order() {
        let mut cache = PacketCache::new(512);
        for i in 0..3u8 {
            cache
                .store(&global_call(1, CacheMode::Append, 5, &[i]))
                .unwrap();
        }
        let replay = cache.query(CacheScope::Global, 5, true, PeerId(9));
        let args: Vec<_> = replay
            .iter()
            .map(|c| match &c.packet {
                Packet::GlobalRpc { args, .. } => args[0],
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(args, vec![0, 1, 2]);
    }

    #[test]
    fn test_append_cap_evicts_oldest() {
        let mut cache = PacketCache::new(2);
        for i in 0..4u8 {
            cache
                .store(&global_call(1, CacheMode::Append, 5, &[i]))
                .unwrap();
        }
        let replay = cache.query(CacheScope::Global, 5, true, PeerId(9));
        assert_eq!(replay.len(), 2);
        assert_eq!(
            replay[0].packet,
            global_call(1, CacheMode::Append, 5, &[2])
        );
    }

    #[test]
    fn test_none_mode_is_not_retained() {
        let mut cache = PacketCache::new(512);
        cache
            .store(&global_call(1, CacheMode::None, 3, b"x"))
            .unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_include_own_filters_the_requesters_sends() {
        let mut cache = PacketCache::new(512);
        cache
            .store(&global_call(1, CacheMode::Overwrite, 3, b"mine"))
            .unwrap();
        cache
            .store(&global_call(2, CacheMode::Overwrite, 3, b"theirs"))
            .unwrap();

        let without_own = cache.query(CacheScope::Global, 3, false, PeerId(1));
        assert_eq!(without_own.len(), 1);
        assert_eq!(without_own[0].sender, PeerId(2));

        let with_own = cache.query(CacheScope::Global, 3, true, PeerId(1));
        assert_eq!(with_own.len(), 2);
    }

    #[test]
    fn test_scope_filters_by_kind_and_id() {
        let mut cache = PacketCache::new(512);
        cache
            .store(&global_call(1, CacheMode::Overwrite, 3, b"g"))
            .unwrap();
        cache
            .store(&Packet::InstanceRpc {
                sender: PeerId(1),
                target: pulsar_proto::TargetFilter::All,
                cache: CacheMode::Overwrite,
                view_id: 10,
                rpc_id: 3,
                instance_id: 0,
                args: b"i".to_vec(),
            })
            .unwrap();

        assert_eq!(cache.query(CacheScope::Global, 3, true, PeerId(9)).len(), 1);
        assert_eq!(
            cache.query(CacheScope::Instance, 3, true, PeerId(9)).len(),
            1
        );
        assert_eq!(cache.query(CacheScope::All, 0, true, PeerId(9)).len(), 2);
    }

    #[test]
    fn test_purge_drops_a_departing_peers_calls() {
        let mut cache = PacketCache::new(512);
        cache
            .store(&global_call(1, CacheMode::Overwrite, 3, b"a"))
            .unwrap();
        cache
            .store(&global_call(1, CacheMode::Append, 4, b"b"))
            .unwrap();
        cache
            .store(&global_call(2, CacheMode::Append, 4, b"c"))
            .unwrap();

        cache.purge_sender(PeerId(1));
        assert_eq!(cache.len(), 1);
        let replay = cache.query(CacheScope::All, 0, true, PeerId(9));
        assert_eq!(replay[0].sender, PeerId(2));
    }

    #[test]
    fn test_uncacheable_kind_is_rejected() {
        let mut cache = PacketCache::new(512);
        let result = cache.store(&Packet::TcpKeepAlive);
        assert!(matches!(
            result,
            Err(CacheError::NotCacheable {
                tag: PacketTag::TcpKeepAlive
            })
        ));
    }
}
