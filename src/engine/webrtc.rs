//! [`MediaEngine`] implementation backed by the `webrtc` crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::IceServer;
use crate::engine::{
    ConnectionState, EngineEvent, MediaEngine, MediaSession, RemoteTrack, SessionEvent,
    SignalingState, TrackKind, TrackSpec,
};
use crate::protocol::signaling::{
    CandidateInit, SdpKind, SessionDescription, TurnCredentials,
};
use crate::CallError;

fn to_engine_error(err: webrtc::Error) -> CallError {
    CallError::Engine(err.to_string())
}

fn build_api() -> Result<API, CallError> {
    let mut media_engine = RtcMediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_engine_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(to_engine_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Creates one `RTCPeerConnection` per remote peer, all sharing the
/// engine's current ICE server set.
pub struct WebRtcEngine {
    ice_servers: Mutex<Vec<IceServer>>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers: Mutex::new(ice_servers),
        }
    }

    fn current_ice_servers(&self) -> Vec<RTCIceServer> {
        let guard = self
            .ice_servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.iter().map(to_rtc_ice_server).collect()
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_session(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn MediaSession>, CallError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: self.current_ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_engine_error)?,
        );

        let session = WebRtcSession {
            peer_id: peer_id.to_string(),
            pc: Arc::clone(&pc),
        };
        session.wire_callbacks(events);
        Ok(Arc::new(session))
    }

    fn add_turn_server(&self, credentials: &TurnCredentials) {
        let mut guard = self
            .ice_servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(IceServer {
            urls: credentials.urls.clone(),
            username: Some(credentials.username.clone()),
            credential: Some(credentials.password.clone()),
        });
    }
}

struct WebRtcSession {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcSession {
    fn wire_callbacks(&self, events: mpsc::UnboundedSender<EngineEvent>) {
        let peer_id = self.peer_id.clone();
        let tx = events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let peer_id = peer_id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EngineEvent {
                    peer_id,
                    event: SessionEvent::NegotiationNeeded,
                });
            })
        }));

        let peer_id = self.peer_id.clone();
        let tx = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let peer_id = peer_id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let init = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(json) => Some(CandidateInit {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }),
                        Err(err) => {
                            warn!(target = "engine", peer = %peer_id, error = %err, "failed to serialize local candidate");
                            return;
                        }
                    },
                    None => None,
                };
                let _ = tx.send(EngineEvent {
                    peer_id,
                    event: SessionEvent::LocalCandidate(init),
                });
            })
        }));

        let peer_id = self.peer_id.clone();
        let tx = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let peer_id = peer_id.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    debug!(target = "engine", peer = %peer_id, state = %state, "connection state changed");
                    let _ = tx.send(EngineEvent {
                        peer_id,
                        event: SessionEvent::ConnectionState(map_connection_state(state)),
                    });
                })
            }));

        let peer_id = self.peer_id.clone();
        let tx = events.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let peer_id = peer_id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let _ = tx.send(EngineEvent {
                    peer_id,
                    event: SessionEvent::RemoteTrack(RemoteTrack {
                        kind,
                        id: track.id(),
                    }),
                });
            })
        }));

        let peer_id = self.peer_id.clone();
        let tx = events;
        self.pc.on_data_channel(Box::new(move |dc| {
            let peer_id = peer_id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let label = dc.label().to_string();
                let _ = tx.send(EngineEvent {
                    peer_id,
                    event: SessionEvent::DataChannel {
                        label: label.clone(),
                    },
                });
                // Announcement channels carry their payload in the label;
                // close them once observed so they do not linger.
                let closer = Arc::clone(&dc);
                dc.on_open(Box::new(move || {
                    let closer = Arc::clone(&closer);
                    Box::pin(async move {
                        let _ = closer.close().await;
                    })
                }));
            })
        }));
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed | RTCPeerConnectionState::Unspecified => {
            ConnectionState::Closed
        }
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed | RTCSignalingState::Unspecified => SignalingState::Closed,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, CallError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(to_engine_error),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(to_engine_error),
        SdpKind::Reset => Err(CallError::Engine(
            "reset sentinel is not applicable SDP".to_string(),
        )),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Option<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => Some(SessionDescription::answer(desc.sdp)),
        _ => None,
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    async fn set_local_description_implicit(&self) -> Result<(), CallError> {
        // No parameterless set_local_description here, so infer the
        // description the way browsers do: answer a pending remote
        // offer, otherwise produce an offer.
        let desc = match self.pc.signaling_state() {
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => self
                .pc
                .create_answer(None)
                .await
                .map_err(to_engine_error)?,
            RTCSignalingState::Closed | RTCSignalingState::Unspecified => {
                return Err(CallError::Engine("connection is closed".to_string()));
            }
            _ => self.pc.create_offer(None).await.map_err(to_engine_error)?,
        };
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_engine_error)
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await.map_err(to_engine_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await.map_err(to_engine_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let rtc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(to_engine_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc_description(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let rtc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(to_engine_error)
    }

    async fn add_remote_candidate(
        &self,
        candidate: Option<CandidateInit>,
    ) -> Result<(), CallError> {
        let init = match candidate {
            Some(c) => RTCIceCandidateInit {
                candidate: c.candidate,
                sdp_mid: c.sdp_mid,
                sdp_mline_index: c.sdp_mline_index,
                ..Default::default()
            },
            // End of candidates maps to an empty candidate line.
            None => RTCIceCandidateInit::default(),
        };
        self.pc.add_ice_candidate(init).await.map_err(to_engine_error)
    }

    async fn add_track(&self, spec: &TrackSpec) -> Result<(), CallError> {
        let capability = match spec.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            spec.label.clone(),
            format!("{}-{}", self.peer_id, spec.label),
        ));
        self.pc.add_track(track).await.map_err(to_engine_error)?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), CallError> {
        self.pc
            .create_data_channel(label, None)
            .await
            .map_err(to_engine_error)?;
        Ok(())
    }

    async fn close(&self) {
        // Settling can outlive the call that triggered the teardown;
        // detach it so reset-and-retry is not serialized behind it.
        let pc = Arc::clone(&self.pc);
        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            if let Err(err) = pc.close().await {
                debug!(target = "engine", peer = %peer_id, error = %err, "close failed");
            }
        });
    }
}
