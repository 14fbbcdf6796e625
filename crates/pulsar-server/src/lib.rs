//! The Pulsar relay server.
//!
//! Accepts reliable-stream connections, admits peers through the handshake
//! gate, and relays procedure calls, chat, and state blobs between peers
//! over both transports. All inbound packets funnel through one bounded
//! ingress pipeline into a single dispatch task, so dispatch never races
//! with itself.

mod dispatch;
mod server;

pub use server::{PulsarServer, ServerError, ServerHandle};
