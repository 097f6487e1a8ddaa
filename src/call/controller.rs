//! Call controller.
//!
//! One task owns the whole call: room membership, the per-peer
//! registry, and every negotiation flag. Room events and engine events
//! funnel into the same loop, so per-peer state is only ever touched
//! from here and needs no locking.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::call::negotiation::{self, DescriptionOutcome};
use crate::call::registry::PeerRegistry;
use crate::call::{CallCommand, CallEvent};
use crate::config::CallConfig;
use crate::engine::{EngineEvent, MediaEngine, SessionEvent};
use crate::protocol::signaling::{PeerId, SessionDescription, SignalPayload};
use crate::signaling::{RoomEvent, SignalSink};

/// Prefix for the data channel that carries a display name in its label.
const NAME_CHANNEL_PREFIX: &str = "name:";

pub struct CallController {
    config: CallConfig,
    self_id: Option<PeerId>,
    display_name: Option<String>,
    engine: Arc<dyn MediaEngine>,
    registry: PeerRegistry,
    signals: Arc<dyn SignalSink>,
    events: mpsc::UnboundedSender<CallEvent>,
    engine_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        engine: Arc<dyn MediaEngine>,
        signals: Arc<dyn SignalSink>,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let display_name = config.display_name.clone();
        let registry = PeerRegistry::new(Arc::clone(&engine), engine_tx);
        Self {
            config,
            self_id: None,
            display_name,
            engine,
            registry,
            signals,
            events,
            engine_rx: Some(engine_rx),
        }
    }

    /// Drive the call until the room closes or the application hangs up.
    pub async fn run(
        mut self,
        mut room_rx: mpsc::UnboundedReceiver<RoomEvent>,
        mut commands_rx: mpsc::UnboundedReceiver<CallCommand>,
    ) {
        let Some(mut engine_rx) = self.engine_rx.take() else {
            return;
        };
        loop {
            tokio::select! {
                event = room_rx.recv() => {
                    let event = event.unwrap_or(RoomEvent::Closed);
                    if !self.handle_room_event(event).await {
                        break;
                    }
                }
                Some(event) = engine_rx.recv() => {
                    self.handle_engine_event(event).await;
                }
                command = commands_rx.recv() => {
                    let command = command.unwrap_or(CallCommand::Leave);
                    if !self.handle_command(command).await {
                        break;
                    }
                }
            }
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    /// Returns false when the call is over.
    async fn handle_room_event(&mut self, event: RoomEvent) -> bool {
        match event {
            RoomEvent::Joined { self_id } => {
                info!(target = "call", %self_id, room = %self.config.room, "joined room");
                self.self_id = Some(self_id.clone());
                self.emit(CallEvent::Joined { self_id });
            }
            RoomEvent::Roster { peers, turn } => {
                if let Some(credentials) = turn {
                    info!(target = "call", urls = ?credentials.urls, "adopting relay turn credentials");
                    self.engine.add_turn_server(&credentials);
                }
                // Members already in the room outrank us: we are the
                // polite side toward each of them.
                for peer_id in peers {
                    if Some(&peer_id) == self.self_id.as_ref() {
                        continue;
                    }
                    self.discover_peer(&peer_id, true).await;
                }
            }
            RoomEvent::PeerJoined { peer_id } => {
                // Late joiner: they treat us as polite, so we take the
                // impolite role.
                self.discover_peer(&peer_id, false).await;
            }
            RoomEvent::PeerLeft { peer_id } => {
                if self.registry.destroy(&peer_id).await {
                    info!(target = "call", peer = %peer_id, "peer left");
                    self.emit(CallEvent::PeerLeft { peer_id });
                }
            }
            RoomEvent::Signal { from_peer, payload } => {
                self.handle_signal(&from_peer, payload).await;
            }
            RoomEvent::Closed => {
                info!(target = "call", "signaling transport closed");
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    async fn handle_signal(&mut self, from_peer: &str, payload: SignalPayload) {
        if !self.registry.contains(from_peer) {
            // Departed peers can still have frames in flight.
            debug!(target = "call", peer = %from_peer, "dropping signal from unknown peer");
            return;
        }
        match payload {
            SignalPayload::Description(desc) => {
                let signals = Arc::clone(&self.signals);
                let outcome = match self.registry.get_mut(from_peer) {
                    Some(entry) => {
                        negotiation::handle_remote_description(
                            from_peer,
                            entry,
                            signals.as_ref(),
                            desc,
                        )
                        .await
                    }
                    None => return,
                };
                match outcome {
                    Ok(DescriptionOutcome::Reset) => self.reset_and_retry(from_peer).await,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target = "call", peer = %from_peer, error = %err, "failed to send description");
                    }
                }
            }
            SignalPayload::Candidate(candidate) => {
                let Some(entry) = self.registry.get_mut(from_peer) else {
                    return;
                };
                if let Err(err) =
                    negotiation::handle_remote_candidate(from_peer, entry, candidate).await
                {
                    warn!(target = "call", peer = %from_peer, error = %err, "failed to add remote candidate");
                    self.emit(CallEvent::CandidateFailed {
                        peer_id: from_peer.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        let EngineEvent { peer_id, event } = event;
        match event {
            SessionEvent::NegotiationNeeded => {
                let signals = Arc::clone(&self.signals);
                let Some(entry) = self.registry.get_mut(&peer_id) else {
                    debug!(target = "call", peer = %peer_id, "negotiation event for unknown peer");
                    return;
                };
                if let Err(err) =
                    negotiation::handle_negotiation_needed(&peer_id, entry, signals.as_ref()).await
                {
                    warn!(target = "call", peer = %peer_id, error = %err, "failed to send offer");
                }
            }
            SessionEvent::LocalCandidate(candidate) => {
                if !self.registry.contains(&peer_id) {
                    return;
                }
                if let Err(err) = self
                    .signals
                    .send_signal(&peer_id, SignalPayload::Candidate(candidate))
                {
                    debug!(target = "call", peer = %peer_id, error = %err, "failed to forward local candidate");
                }
            }
            SessionEvent::ConnectionState(state) => {
                info!(target = "call", peer = %peer_id, ?state, "connection state changed");
                self.emit(CallEvent::ConnectionState { peer_id, state });
            }
            SessionEvent::RemoteTrack(track) => {
                self.emit(CallEvent::RemoteTrack { peer_id, track });
            }
            SessionEvent::DataChannel { label } => {
                if let Some(name) = label.strip_prefix(NAME_CHANNEL_PREFIX) {
                    self.emit(CallEvent::PeerDisplayName {
                        peer_id,
                        name: name.to_string(),
                    });
                } else {
                    debug!(target = "call", peer = %peer_id, %label, "unexpected data channel");
                }
            }
        }
    }

    /// Returns false when the call is over.
    async fn handle_command(&mut self, command: CallCommand) -> bool {
        match command {
            CallCommand::SetDisplayName(name) => {
                self.display_name = Some(name);
                for peer_id in self.registry.peer_ids() {
                    self.announce_name(&peer_id).await;
                }
                true
            }
            CallCommand::Leave => {
                info!(target = "call", "leaving call");
                self.shutdown().await;
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        self.signals.close();
        self.registry.destroy_all().await;
        self.emit(CallEvent::Left);
    }

    async fn discover_peer(&mut self, peer_id: &str, polite: bool) {
        info!(target = "call", peer = %peer_id, polite, "discovered peer");
        if let Err(err) = self.registry.create(peer_id, polite).await {
            warn!(target = "call", peer = %peer_id, error = %err, "failed to create connection");
            return;
        }
        self.emit(CallEvent::PeerDiscovered {
            peer_id: peer_id.to_string(),
            polite,
        });
        self.establish_call_features(peer_id).await;
    }

    /// Attach local media and announce our name. Adding tracks is what
    /// kicks off negotiation on the side that is not holding back.
    async fn establish_call_features(&mut self, peer_id: &str) {
        let tracks = self.config.tracks.clone();
        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };
        let session = Arc::clone(&entry.session);
        for spec in &tracks {
            if let Err(err) = session.add_track(spec).await {
                warn!(target = "call", peer = %peer_id, track = %spec.label, error = %err, "failed to add track");
            }
        }
        if self.display_name.is_some() {
            self.announce_name(peer_id).await;
        }
    }

    async fn announce_name(&mut self, peer_id: &str) {
        let Some(name) = self.display_name.clone() else {
            return;
        };
        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };
        if entry.announced_name.as_deref() == Some(name.as_str()) {
            return;
        }
        let session = Arc::clone(&entry.session);
        if let Err(err) = session
            .create_data_channel(&format!("{NAME_CHANNEL_PREFIX}{name}"))
            .await
        {
            warn!(target = "call", peer = %peer_id, error = %err, "failed to announce display name");
            return;
        }
        if let Some(entry) = self.registry.get_mut(peer_id) {
            entry.announced_name = Some(name);
        }
    }

    /// Tear the pair down and rebuild it with the same politeness. The
    /// polite side holds its first offer back and tells the remote to
    /// reset too, so exactly one side leads the retry.
    async fn reset_and_retry(&mut self, peer_id: &str) {
        let Some(entry) = self.registry.get(peer_id) else {
            return;
        };
        let polite = entry.polite;
        info!(target = "call", peer = %peer_id, polite, "resetting connection");

        match self.registry.create(peer_id, polite).await {
            Ok(entry) => {
                entry.flags.suppressing_initial_offer = polite;
            }
            Err(err) => {
                warn!(target = "call", peer = %peer_id, error = %err, "failed to rebuild connection");
                self.registry.destroy(peer_id).await;
                self.emit(CallEvent::PeerLeft {
                    peer_id: peer_id.to_string(),
                });
                return;
            }
        }
        self.establish_call_features(peer_id).await;
        if polite {
            let result = self
                .signals
                .send_signal(peer_id, SignalPayload::Description(SessionDescription::reset()));
            if let Err(err) = result {
                warn!(target = "call", peer = %peer_id, error = %err, "failed to send reset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::engine::{ConnectionState, TrackSpec};
    use crate::protocol::signaling::TurnCredentials;
    use crate::CallError;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, SignalPayload)>>,
        closed: Mutex<bool>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<(String, SignalPayload)> {
            self.sent.lock().unwrap().clone()
        }

        fn reset_count(&self, to_peer: &str) -> usize {
            self.sent()
                .iter()
                .filter(|(to, payload)| {
                    to == to_peer
                        && matches!(
                            payload,
                            SignalPayload::Description(desc) if desc.is_reset()
                        )
                })
                .count()
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    impl SignalSink for RecordingSink {
        fn send_signal(&self, to_peer: &str, payload: SignalPayload) -> Result<(), CallError> {
            self.sent
                .lock()
                .unwrap()
                .push((to_peer.to_string(), payload));
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct Fixture {
        controller: CallController,
        engine: Arc<MockEngine>,
        sink: Arc<RecordingSink>,
        events_rx: mpsc::UnboundedReceiver<CallEvent>,
    }

    fn fixture(config: CallConfig) -> Fixture {
        let engine = MockEngine::new();
        let sink = Arc::new(RecordingSink::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = CallController::new(
            config,
            engine.clone(),
            sink.clone() as Arc<dyn SignalSink>,
            events_tx,
        );
        Fixture {
            controller,
            engine,
            sink,
            events_rx,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(CallConfig::new("ws://127.0.0.1:8080", "room"))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn join(fx: &mut Fixture, self_id: &str) {
        fx.controller
            .handle_room_event(RoomEvent::Joined {
                self_id: self_id.to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn roster_members_are_polite_and_get_media() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::Roster {
                peers: vec!["a".into(), "b".into(), "me".into()],
                turn: None,
            })
            .await;

        for peer in ["a", "b"] {
            let entry = fx.controller.registry.get(peer).unwrap();
            assert!(entry.polite);
            assert_eq!(fx.engine.session(peer).unwrap().tracks().len(), 2);
        }
        assert!(!fx.controller.registry.contains("me"));

        let events = drain(&mut fx.events_rx);
        let discovered: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, CallEvent::PeerDiscovered { polite: true, .. }))
            .collect();
        assert_eq!(discovered.len(), 2);
    }

    #[tokio::test]
    async fn late_joiners_get_the_impolite_role() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "late".into(),
            })
            .await;

        let entry = fx.controller.registry.get("late").unwrap();
        assert!(!entry.polite);
    }

    #[tokio::test]
    async fn roster_turn_credentials_reach_the_engine() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        let turn = TurnCredentials {
            urls: vec!["turn:relay.example.org:3478".into()],
            username: "u".into(),
            password: "p".into(),
        };
        fx.controller
            .handle_room_event(RoomEvent::Roster {
                peers: vec![],
                turn: Some(turn.clone()),
            })
            .await;
        assert_eq!(fx.engine.turn_servers(), vec![turn]);
    }

    #[tokio::test]
    async fn departure_tears_the_connection_down() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "a".into(),
            })
            .await;
        fx.controller
            .handle_room_event(RoomEvent::PeerLeft {
                peer_id: "a".into(),
            })
            .await;

        assert!(fx.controller.registry.is_empty());
        assert!(fx.engine.session("a").unwrap().is_closed());
        let events = drain(&mut fx.events_rx);
        assert!(events.contains(&CallEvent::PeerLeft {
            peer_id: "a".into()
        }));

        // Signals that were already in flight are dropped quietly.
        fx.controller
            .handle_room_event(RoomEvent::Signal {
                from_peer: "a".into(),
                payload: SignalPayload::Candidate(None),
            })
            .await;
    }

    #[tokio::test]
    async fn rejected_description_triggers_reset_with_preserved_politeness() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::Roster {
                peers: vec!["a".into()],
                turn: None,
            })
            .await;
        fx.engine
            .session("a")
            .unwrap()
            .fail_remote_description
            .store(true, std::sync::atomic::Ordering::Relaxed);

        fx.controller
            .handle_room_event(RoomEvent::Signal {
                from_peer: "a".into(),
                payload: SignalPayload::Description(SessionDescription::offer("v=0 bad")),
            })
            .await;

        let sessions = fx.engine.sessions_for("a");
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].is_closed());
        assert!(!sessions[1].is_closed());
        // Media is re-attached to the rebuilt connection.
        assert_eq!(sessions[1].tracks().len(), 2);

        let entry = fx.controller.registry.get("a").unwrap();
        assert!(entry.polite);
        assert!(entry.flags.suppressing_initial_offer);
        // The polite side tells the remote to rebuild too.
        assert_eq!(fx.sink.reset_count("a"), 1);
    }

    #[tokio::test]
    async fn impolite_reset_does_not_send_the_sentinel() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "late".into(),
            })
            .await;

        fx.controller
            .handle_room_event(RoomEvent::Signal {
                from_peer: "late".into(),
                payload: SignalPayload::Description(SessionDescription::reset()),
            })
            .await;

        let entry = fx.controller.registry.get("late").unwrap();
        assert!(!entry.polite);
        assert!(!entry.flags.suppressing_initial_offer);
        assert_eq!(fx.engine.sessions_for("late").len(), 2);
        assert_eq!(fx.sink.reset_count("late"), 0);
    }

    #[tokio::test]
    async fn display_name_announced_once_per_name() {
        let mut fx =
            fixture(CallConfig::new("ws://127.0.0.1:8080", "room").with_display_name("Alice"));
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "a".into(),
            })
            .await;

        let session = fx.engine.session("a").unwrap();
        assert_eq!(session.channel_labels(), vec!["name:Alice".to_string()]);

        // Same name again is a no-op.
        fx.controller
            .handle_command(CallCommand::SetDisplayName("Alice".into()))
            .await;
        assert_eq!(session.channel_labels().len(), 1);

        // A new name is announced to every peer.
        fx.controller
            .handle_command(CallCommand::SetDisplayName("Alicia".into()))
            .await;
        assert_eq!(
            session.channel_labels(),
            vec!["name:Alice".to_string(), "name:Alicia".to_string()]
        );
    }

    #[tokio::test]
    async fn incoming_name_channel_becomes_an_event() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "a".into(),
            })
            .await;
        drain(&mut fx.events_rx);

        fx.controller
            .handle_engine_event(EngineEvent {
                peer_id: "a".into(),
                event: SessionEvent::DataChannel {
                    label: "name:Bob".into(),
                },
            })
            .await;

        let events = drain(&mut fx.events_rx);
        assert!(events.contains(&CallEvent::PeerDisplayName {
            peer_id: "a".into(),
            name: "Bob".into()
        }));
    }

    #[tokio::test]
    async fn candidate_failure_surfaces_as_event_when_not_ignoring() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "a".into(),
            })
            .await;
        fx.engine
            .session("a")
            .unwrap()
            .fail_candidates
            .store(true, std::sync::atomic::Ordering::Relaxed);
        drain(&mut fx.events_rx);

        fx.controller
            .handle_room_event(RoomEvent::Signal {
                from_peer: "a".into(),
                payload: SignalPayload::Candidate(None),
            })
            .await;

        let events = drain(&mut fx.events_rx);
        assert!(matches!(
            events.as_slice(),
            [CallEvent::CandidateFailed { peer_id, .. }] if peer_id == "a"
        ));
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_verbatim() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "a".into(),
            })
            .await;

        fx.controller
            .handle_engine_event(EngineEvent {
                peer_id: "a".into(),
                event: SessionEvent::LocalCandidate(None),
            })
            .await;

        assert!(fx
            .sink
            .sent()
            .contains(&("a".to_string(), SignalPayload::Candidate(None))));
    }

    #[tokio::test]
    async fn connection_state_changes_are_reported() {
        let mut fx = default_fixture();
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "a".into(),
            })
            .await;
        drain(&mut fx.events_rx);

        fx.controller
            .handle_engine_event(EngineEvent {
                peer_id: "a".into(),
                event: SessionEvent::ConnectionState(ConnectionState::Connected),
            })
            .await;

        let events = drain(&mut fx.events_rx);
        assert!(events.contains(&CallEvent::ConnectionState {
            peer_id: "a".into(),
            state: ConnectionState::Connected
        }));
    }

    #[tokio::test]
    async fn leave_closes_transport_and_sessions() {
        let mut fx = fixture(
            CallConfig::new("ws://127.0.0.1:8080", "room")
                .with_tracks(vec![TrackSpec::audio("mic")]),
        );
        join(&mut fx, "me").await;
        fx.controller
            .handle_room_event(RoomEvent::PeerJoined {
                peer_id: "a".into(),
            })
            .await;

        let keep_going = fx.controller.handle_command(CallCommand::Leave).await;
        assert!(!keep_going);
        assert!(fx.sink.is_closed());
        assert!(fx.engine.session("a").unwrap().is_closed());
        let events = drain(&mut fx.events_rx);
        assert!(events.contains(&CallEvent::Left));
    }
}
