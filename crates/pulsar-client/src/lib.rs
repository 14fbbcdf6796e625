//! The Pulsar client endpoint.
//!
//! Manages the full session lifecycle: connect, handshake, datagram
//! rendezvous, dual keep-alives, and clean disconnect. Inbound procedure
//! calls are dispatched through registered handler tables; everything else
//! surfaces as a [`ClientEvent`]. Session state changes are broadcast via a
//! [`tokio::sync::watch`] channel so any number of consumers can react
//! without polling.

mod call;
mod client;

pub use call::{CallBuilder, CallError};
pub use client::{ClientBuilder, ClientError, ClientEvent, PulsarClient, SessionStateWatch};
