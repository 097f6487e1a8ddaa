//! Media engine seam.
//!
//! The call controller drives negotiation through the [`MediaSession`]
//! trait rather than a concrete peer connection, so the state machine
//! can be exercised against a scriptable in-process engine as well as
//! the real WebRTC stack.

pub mod mock;
pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::signaling::{CandidateInit, PeerId, SessionDescription, TurnCredentials};
use crate::CallError;

/// Mirror of the RTCPeerConnection signaling states the negotiation
/// logic cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local media source to attach to every peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub kind: TrackKind,
    pub label: String,
}

impl TrackSpec {
    pub fn audio(label: impl Into<String>) -> Self {
        Self {
            kind: TrackKind::Audio,
            label: label.into(),
        }
    }

    pub fn video(label: impl Into<String>) -> Self {
        Self {
            kind: TrackKind::Video,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
}

/// Asynchronous notifications a session raises while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection wants (re)negotiation, e.g. after a track was added.
    NegotiationNeeded,
    /// A locally gathered ICE candidate; `None` marks end of gathering.
    LocalCandidate(Option<CandidateInit>),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
    /// The remote side opened a data channel toward us.
    DataChannel { label: String },
}

/// A session event tagged with the remote peer it belongs to, so one
/// receiver can serve every session in a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub peer_id: PeerId,
    pub event: SessionEvent,
}

/// One peer connection, owned by the call controller. All methods are
/// async because the real implementation crosses into the WebRTC
/// runtime.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn signaling_state(&self) -> SignalingState;

    /// Parameterless local-description rollup: create and apply whatever
    /// description the current signaling state calls for (an answer when
    /// a remote offer is pending, an offer otherwise).
    async fn set_local_description_implicit(&self) -> Result<(), CallError>;

    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    /// `None` signals end of remote candidates.
    async fn add_remote_candidate(&self, candidate: Option<CandidateInit>)
        -> Result<(), CallError>;

    async fn add_track(&self, spec: &TrackSpec) -> Result<(), CallError>;
    async fn create_data_channel(&self, label: &str) -> Result<(), CallError>;

    /// Tear the connection down. Must be safe to call more than once and
    /// must not block the caller on engine-internal settling.
    async fn close(&self);
}

/// Factory for [`MediaSession`]s. Shared engine-level state (ICE server
/// set) lives here so sessions created after a TURN grant pick it up.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_session(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn MediaSession>, CallError>;

    /// Append relay-minted TURN credentials to the ICE server set used
    /// by sessions created from now on. Existing sessions are unaffected.
    fn add_turn_server(&self, credentials: &TurnCredentials);
}
