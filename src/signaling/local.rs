//! In-process signaling hub.
//!
//! Routes signals between participants through the same [`RoomEvent`]
//! surface the WebSocket client provides, with no relay or sockets
//! involved. Compiled unconditionally so downstream crates can drive
//! call logic hermetically too.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::signaling::{PeerId, SignalPayload, TurnCredentials};
use crate::signaling::{RoomEvent, SignalSink};
use crate::CallError;

#[derive(Default)]
struct RoomInner {
    members: HashMap<PeerId, mpsc::UnboundedSender<RoomEvent>>,
    turn: Option<TurnCredentials>,
}

/// A room whose membership and signal routing happen in memory.
#[derive(Clone, Default)]
pub struct LocalRoom {
    inner: Arc<Mutex<RoomInner>>,
}

impl LocalRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// A room that hands out the given TURN credentials with its roster.
    pub fn with_turn(turn: TurnCredentials) -> Self {
        let room = Self::new();
        lock(&room.inner).turn = Some(turn);
        room
    }

    /// Join the room. Delivers `Joined` and `Roster` into the returned
    /// receiver before anything else, then notifies existing members.
    pub fn join(&self) -> (LocalParticipant, mpsc::UnboundedReceiver<RoomEvent>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);

        let _ = tx.send(RoomEvent::Joined {
            self_id: id.clone(),
        });
        let _ = tx.send(RoomEvent::Roster {
            peers: inner.members.keys().cloned().collect(),
            turn: inner.turn.clone(),
        });
        for sender in inner.members.values() {
            let _ = sender.send(RoomEvent::PeerJoined {
                peer_id: id.clone(),
            });
        }
        inner.members.insert(id.clone(), tx);
        debug!(target = "signaling", peer = %id, "joined local room");

        (
            LocalParticipant {
                id,
                inner: Arc::clone(&self.inner),
            },
            rx,
        )
    }
}

pub struct LocalParticipant {
    id: PeerId,
    inner: Arc<Mutex<RoomInner>>,
}

impl LocalParticipant {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl SignalSink for LocalParticipant {
    fn send_signal(&self, to_peer: &str, payload: SignalPayload) -> Result<(), CallError> {
        let inner = lock(&self.inner);
        let member = inner
            .members
            .get(to_peer)
            .ok_or_else(|| CallError::Signaling(format!("unknown peer {to_peer}")))?;
        member
            .send(RoomEvent::Signal {
                from_peer: self.id.clone(),
                payload,
            })
            .map_err(|_| CallError::ChannelClosed)
    }

    fn close(&self) {
        let mut inner = lock(&self.inner);
        if let Some(own) = inner.members.remove(&self.id) {
            let _ = own.send(RoomEvent::Closed);
        }
        for sender in inner.members.values() {
            let _ = sender.send(RoomEvent::PeerLeft {
                peer_id: self.id.clone(),
            });
        }
    }
}

fn lock(inner: &Mutex<RoomInner>) -> std::sync::MutexGuard<'_, RoomInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
