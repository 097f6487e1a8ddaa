//! Signaling transports.
//!
//! The call controller consumes a stream of [`RoomEvent`]s and pushes
//! outbound signals through a [`SignalSink`]. The WebSocket client in
//! [`client`] is the production transport; [`local`] wires controllers
//! together in-process for tests.

pub mod client;
pub mod local;

use crate::protocol::signaling::{PeerId, SignalPayload, TurnCredentials};
use crate::CallError;

/// Room membership and signal traffic, as seen by one participant.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Our transport-assigned identifier; first event after connecting.
    Joined { self_id: PeerId },
    /// Members already present when we joined, plus optional TURN
    /// credentials minted by the relay.
    Roster {
        peers: Vec<PeerId>,
        turn: Option<TurnCredentials>,
    },
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    Signal {
        from_peer: PeerId,
        payload: SignalPayload,
    },
    /// The transport closed; no further events will arrive.
    Closed,
}

/// Outbound half of a signaling transport.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, to_peer: &str, payload: SignalPayload) -> Result<(), CallError>;

    /// Leave the room and release transport resources.
    fn close(&self);
}
