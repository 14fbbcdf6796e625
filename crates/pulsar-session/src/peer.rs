//! Per-peer session state.
//!
//! Every connection walks the same one-way state machine:
//!
//! ```text
//! Connecting -> Handshaking -> Ready -> Closing -> Closed
//! ```
//!
//! Closing can be entered from any live state; no transition ever moves
//! backwards. Until a peer is `Ready`, only session-setup packets are
//! accepted for it.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use pulsar_proto::PeerId;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport connected, nothing exchanged yet.
    Connecting,
    /// Handshake packet seen, waiting on authentication.
    Handshaking,
    /// Fully admitted; all packet kinds flow.
    Ready,
    /// Teardown started, flushing final packets.
    Closing,
    /// Fully torn down.
    Closed,
}

impl SessionState {
    /// Whether moving to `next` is a legal forward step.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Ready)
                | (Connecting, Closing)
                | (Handshaking, Closing)
                | (Ready, Closing)
                | (Closing, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Errors raised by session state handling.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    /// An illegal state transition was attempted.
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// A gated packet arrived before the session was ready.
    #[error("session not ready (state {state})")]
    NotReady { state: SessionState },
}

/// A connected peer's session record.
#[derive(Debug)]
pub struct Peer {
    /// Assigned identity; valid for the lifetime of this session only.
    pub id: PeerId,
    /// Display name reported during admission.
    pub name: String,
    /// Reliable-transport remote address.
    pub addr: SocketAddr,
    /// Datagram return address, recorded from the first datagram this peer
    /// sends. `None` until then; datagram sends to the peer are suppressed
    /// while unset.
    pub udp_addr: Option<SocketAddr>,
    /// Application-defined property blob, broadcast on change.
    pub properties: String,
    state: SessionState,
    last_activity: Instant,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            name: format!("Peer#{}", id.0),
            addr,
            udp_addr: None,
            properties: String::new(),
            state: SessionState::Connecting,
            last_activity: Instant::now(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attempt a state transition, rejecting anything not on the forward
    /// path.
    pub fn transition_to(&mut self, next: SessionState) -> Result<(), StateError> {
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Whether this peer has been admitted to full packet flow.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Reject unless the session is ready. Used as the gate in front of
    /// every non-setup packet.
    pub fn require_ready(&self) -> Result<(), StateError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(StateError::NotReady { state: self.state })
        }
    }

    /// Refresh the activity clock. Called on every inbound packet from this
    /// peer, keep-alives included.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the peer has been silent longer than `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> Peer {
        Peer::new(PeerId(5), "127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn test_lifecycle_walks_forward() {
        let mut peer = test_peer();
        assert_eq!(peer.state(), SessionState::Connecting);
        peer.transition_to(SessionState::Handshaking).unwrap();
        peer.transition_to(SessionState::Ready).unwrap();
        peer.transition_to(SessionState::Closing).unwrap();
        peer.transition_to(SessionState::Closed).unwrap();
    }

    #[test]
    fn test_no_backwards_transitions() {
        let mut peer = test_peer();
        peer.transition_to(SessionState::Handshaking).unwrap();
        peer.transition_to(SessionState::Ready).unwrap();
        let result = peer.transition_to(SessionState::Handshaking);
        assert_eq!(
            result,
            Err(StateError::InvalidTransition {
                from: SessionState::Ready,
                to: SessionState::Handshaking,
            })
        );
    }

    #[test]
    fn test_skipping_handshake_is_rejected() {
        let mut peer = test_peer();
        assert!(peer.transition_to(SessionState::Ready).is_err());
    }

    #[test]
    fn test_closing_reachable_from_any_live_state() {
        let mut connecting = test_peer();
        assert!(connecting.transition_to(SessionState::Closing).is_ok());

        let mut handshaking = test_peer();
        handshaking.transition_to(SessionState::Handshaking).unwrap();
        assert!(handshaking.transition_to(SessionState::Closing).is_ok());
    }

    #[test]
    fn test_gate_rejects_until_ready() {
        let mut peer = test_peer();
        assert_eq!(
            peer.require_ready(),
            Err(StateError::NotReady {
                state: SessionState::Connecting
            })
        );
        peer.transition_to(SessionState::Handshaking).unwrap();
        assert!(peer.require_ready().is_err());
        peer.transition_to(SessionState::Ready).unwrap();
        assert!(peer.require_ready().is_ok());
    }

    #[test]
    fn test_touch_resets_staleness() {
        let mut peer = test_peer();
        assert!(!peer.is_stale(Duration::from_secs(60)));
        peer.touch();
        assert!(!peer.is_stale(Duration::from_millis(50)));
    }
}
