//! Call orchestration.
//!
//! [`join_call`] connects to the signaling relay and spawns a
//! [`controller::CallController`] that owns every per-peer connection
//! for the lifetime of the call. Applications observe progress through
//! the [`CallEvent`] stream and steer it through the [`Call`] handle.

pub mod controller;
pub mod negotiation;
pub mod registry;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::CallConfig;
use crate::engine::{ConnectionState, RemoteTrack};
use crate::engine::webrtc::WebRtcEngine;
use crate::protocol::signaling::PeerId;
use crate::signaling::client::SignalingClient;
use crate::signaling::SignalSink;
use crate::CallError;

use controller::CallController;

/// Call progress, delivered to the application in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// We are in the room under this identifier.
    Joined { self_id: PeerId },
    /// A connection toward a room member was created. `polite` records
    /// which side yields when offers collide.
    PeerDiscovered { peer_id: PeerId, polite: bool },
    PeerLeft { peer_id: PeerId },
    ConnectionState {
        peer_id: PeerId,
        state: ConnectionState,
    },
    RemoteTrack { peer_id: PeerId, track: RemoteTrack },
    /// The peer announced its display name.
    PeerDisplayName { peer_id: PeerId, name: String },
    /// Adding a remote candidate failed in a state where the failure is
    /// meaningful.
    CandidateFailed { peer_id: PeerId, error: String },
    /// The call ended, either by request or transport loss.
    Left,
}

#[derive(Debug)]
pub(crate) enum CallCommand {
    SetDisplayName(String),
    Leave,
}

/// Handle for steering a running call.
pub struct Call {
    commands: mpsc::UnboundedSender<CallCommand>,
}

impl Call {
    /// Announce (or change) our display name to every peer.
    pub fn set_display_name(&self, name: impl Into<String>) -> Result<(), CallError> {
        self.commands
            .send(CallCommand::SetDisplayName(name.into()))
            .map_err(|_| CallError::ChannelClosed)
    }

    /// Hang up: tear down every peer connection and leave the room.
    pub fn leave(&self) -> Result<(), CallError> {
        self.commands
            .send(CallCommand::Leave)
            .map_err(|_| CallError::ChannelClosed)
    }
}

/// Join a room over the WebSocket relay with the real WebRTC engine.
pub async fn join_call(
    config: CallConfig,
) -> Result<(Call, mpsc::UnboundedReceiver<CallEvent>), CallError> {
    let (client, room_rx) = SignalingClient::connect(&config.signaling_url, &config.room).await?;
    let engine = Arc::new(WebRtcEngine::new(config.ice_servers.clone()));
    let signals: Arc<dyn SignalSink> = client;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let controller = CallController::new(config, engine, signals, events_tx);
    tokio::spawn(controller.run(room_rx, commands_rx));

    Ok((
        Call {
            commands: commands_tx,
        },
        events_rx,
    ))
}

/// Join over an arbitrary transport and engine. This is what the tests
/// use with the local room and mock engine.
pub fn spawn_call(
    config: CallConfig,
    engine: Arc<dyn crate::engine::MediaEngine>,
    signals: Arc<dyn SignalSink>,
    room_rx: mpsc::UnboundedReceiver<crate::signaling::RoomEvent>,
) -> (Call, mpsc::UnboundedReceiver<CallEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let controller = CallController::new(config, engine, signals, events_tx);
    tokio::spawn(controller.run(room_rx, commands_rx));
    (
        Call {
            commands: commands_tx,
        },
        events_rx,
    )
}
