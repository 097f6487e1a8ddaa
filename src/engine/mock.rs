//! Scriptable in-process media engine.
//!
//! No network, no SDP parsing: descriptions are synthetic strings and
//! signaling-state transitions follow the same rules a real peer
//! connection applies. Failure injection knobs let tests force the
//! error paths the negotiation logic has to survive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::{
    EngineEvent, MediaEngine, MediaSession, SessionEvent, SignalingState, TrackSpec,
};
use crate::protocol::signaling::{CandidateInit, SessionDescription, TurnCredentials};
use crate::CallError;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MockEngine {
    /// Every session ever created per peer, in creation order. Reset
    /// flows leave the replaced session here so tests can inspect it.
    sessions: Mutex<HashMap<String, Vec<Arc<MockSession>>>>,
    turn_servers: Mutex<Vec<TurnCredentials>>,
    sdp_counter: AtomicU64,
    /// Knobs copied onto each newly created session.
    pub fail_implicit_local: AtomicBool,
    pub fail_remote_description: AtomicBool,
    pub fail_candidates: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sessions_for(&self, peer_id: &str) -> Vec<Arc<MockSession>> {
        lock(&self.sessions)
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recently created session for a peer.
    pub fn session(&self, peer_id: &str) -> Option<Arc<MockSession>> {
        lock(&self.sessions)
            .get(peer_id)
            .and_then(|list| list.last().cloned())
    }

    pub fn turn_servers(&self) -> Vec<TurnCredentials> {
        lock(&self.turn_servers).clone()
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_session(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn MediaSession>, CallError> {
        let serial = self.sdp_counter.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(MockSession {
            peer_id: peer_id.to_string(),
            serial,
            events,
            state: Mutex::new(SignalingState::Stable),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_implicit_local: AtomicBool::new(
                self.fail_implicit_local.load(Ordering::Relaxed),
            ),
            fail_remote_description: AtomicBool::new(
                self.fail_remote_description.load(Ordering::Relaxed),
            ),
            fail_candidates: AtomicBool::new(self.fail_candidates.load(Ordering::Relaxed)),
        });
        lock(&self.sessions)
            .entry(peer_id.to_string())
            .or_default()
            .push(Arc::clone(&session));
        Ok(session)
    }

    fn add_turn_server(&self, credentials: &TurnCredentials) {
        lock(&self.turn_servers).push(credentials.clone());
    }
}

pub struct MockSession {
    pub peer_id: String,
    serial: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: Mutex<SignalingState>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<Option<CandidateInit>>>,
    tracks: Mutex<Vec<TrackSpec>>,
    channels: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    pub fail_implicit_local: AtomicBool,
    pub fail_remote_description: AtomicBool,
    pub fail_candidates: AtomicBool,
}

impl MockSession {
    fn synthetic_sdp(&self, role: &str) -> String {
        format!("v=0 mock {} {} {}", self.peer_id, self.serial, role)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(EngineEvent {
            peer_id: self.peer_id.clone(),
            event,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn local_desc(&self) -> Option<SessionDescription> {
        lock(&self.local).clone()
    }

    pub fn remote_desc(&self) -> Option<SessionDescription> {
        lock(&self.remote).clone()
    }

    pub fn remote_candidates(&self) -> Vec<Option<CandidateInit>> {
        lock(&self.candidates).clone()
    }

    pub fn tracks(&self) -> Vec<TrackSpec> {
        lock(&self.tracks).clone()
    }

    pub fn channel_labels(&self) -> Vec<String> {
        lock(&self.channels).clone()
    }

    /// Push an event as if the underlying connection raised it.
    pub fn raise(&self, event: SessionEvent) {
        self.emit(event);
    }
}

#[async_trait]
impl MediaSession for MockSession {
    async fn signaling_state(&self) -> SignalingState {
        *lock(&self.state)
    }

    async fn set_local_description_implicit(&self) -> Result<(), CallError> {
        if self.fail_implicit_local.load(Ordering::Relaxed) {
            return Err(CallError::Engine("implicit local description refused".into()));
        }
        let desc = {
            let state = *lock(&self.state);
            match state {
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                    SessionDescription::answer(self.synthetic_sdp("answer"))
                }
                SignalingState::Closed => {
                    return Err(CallError::Engine("connection is closed".into()));
                }
                _ => SessionDescription::offer(self.synthetic_sdp("offer")),
            }
        };
        self.set_local_description(desc).await
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::offer(self.synthetic_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::answer(self.synthetic_sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut state = lock(&self.state);
        *state = if desc.is_offer() {
            SignalingState::HaveLocalOffer
        } else {
            SignalingState::Stable
        };
        *lock(&self.local) = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local_desc()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        if self.fail_remote_description.load(Ordering::Relaxed) {
            return Err(CallError::Engine("remote description refused".into()));
        }
        // A remote offer arriving over a pending local offer rolls the
        // local one back, as perfect negotiation expects of the engine.
        let mut state = lock(&self.state);
        *state = if desc.is_offer() {
            SignalingState::HaveRemoteOffer
        } else {
            SignalingState::Stable
        };
        *lock(&self.remote) = Some(desc);
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: Option<CandidateInit>,
    ) -> Result<(), CallError> {
        if self.fail_candidates.load(Ordering::Relaxed) {
            return Err(CallError::Engine("candidate rejected".into()));
        }
        lock(&self.candidates).push(candidate);
        Ok(())
    }

    async fn add_track(&self, spec: &TrackSpec) -> Result<(), CallError> {
        lock(&self.tracks).push(spec.clone());
        // Real engines renegotiate when media is attached.
        self.emit(SessionEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), CallError> {
        lock(&self.channels).push(label.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        *lock(&self.state) = SignalingState::Closed;
    }
}
