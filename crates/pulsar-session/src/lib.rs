//! Session-layer state shared by the Pulsar server and client: peer
//! lifecycle, id allocation, the RPC registries, the relay cache, the
//! ingress pipeline, and group membership. Nothing in here owns a socket.

pub mod cache;
pub mod clock;
pub mod group;
pub mod idpool;
pub mod peer;
pub mod pipeline;
pub mod rpc;

pub use cache::{CacheError, CachedPacket, PacketCache};
pub use clock::{LossTracker, NetworkClock, RttEstimator};
pub use group::{GroupError, GroupKind, GroupTable};
pub use idpool::{IdPoolError, PeerIdPool};
pub use peer::{Peer, SessionState, StateError};
pub use pipeline::{IngressItem, IngressSender, Pipeline, PipelineError, Transport};
pub use rpc::{RpcArgs, RpcError, RpcHandler, RpcRegistry, ViewRegistry};
