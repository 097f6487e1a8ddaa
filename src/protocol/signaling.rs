//! Wire types exchanged with the signaling relay.
//!
//! Relay frames are JSON objects tagged by a `type` field. Session
//! descriptions and ICE candidates travel opaquely inside a `Signal`
//! frame; the relay forwards them without inspection.

use serde::{Deserialize, Serialize};

pub type PeerId = String;

/// Kind of a session description. `Reset` is an in-band sentinel, not
/// real SDP: receiving it tells the remote side to tear down and
/// rebuild its connection handle for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
    #[serde(rename = "_reset")]
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn reset() -> Self {
        Self {
            kind: SdpKind::Reset,
            sdp: String::new(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }

    pub fn is_answer(&self) -> bool {
        self.kind == SdpKind::Answer
    }

    pub fn is_reset(&self) -> bool {
        self.kind == SdpKind::Reset
    }
}

/// JSON form of an ICE candidate, field names matching the RTCIceCandidate
/// dictionary so browser peers interoperate unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl CandidateInit {
    /// Gathering-complete markers arrive as an empty (or single-char)
    /// candidate string.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.len() <= 1
    }
}

/// Payload of a peer-to-peer signal. A `null` candidate is meaningful
/// (end of candidates) and must round-trip, hence the `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(Option<CandidateInit>),
}

/// Short-lived TURN credentials handed out by the relay alongside the
/// initial roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Signal {
        to_peer: PeerId,
        payload: SignalPayload,
    },
    Ping,
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on connect with the identifier the relay assigned us.
    RoomJoined { peer_id: PeerId },
    /// The members already present when we connected. `turn` carries
    /// relay-minted TURN credentials when the deployment has a TURN
    /// server configured.
    RoomPeers {
        peers: Vec<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn: Option<TurnCredentials>,
    },
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    Signal {
        from_peer: PeerId,
        payload: SignalPayload,
    },
    Pong,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_signal_round_trips() {
        let msg = ClientMessage::Signal {
            to_peer: "peer-2".into(),
            payload: SignalPayload::Description(SessionDescription::offer("v=0\r\n")),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "signal");
        assert_eq!(json["payload"]["description"]["type"], "offer");
        assert_eq!(json["payload"]["description"]["sdp"], "v=0\r\n");

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        match back {
            ClientMessage::Signal { to_peer, payload } => {
                assert_eq!(to_peer, "peer-2");
                assert_eq!(
                    payload,
                    SignalPayload::Description(SessionDescription::offer("v=0\r\n"))
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn reset_sentinel_omits_sdp() {
        let json = serde_json::to_value(SessionDescription::reset()).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "_reset" }));

        let back: SessionDescription = serde_json::from_value(json).unwrap();
        assert!(back.is_reset());
        assert!(back.sdp.is_empty());
    }

    #[test]
    fn null_candidate_round_trips() {
        let payload = SignalPayload::Candidate(None);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({ "candidate": null }));

        let back: SignalPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, SignalPayload::Candidate(None));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let payload = SignalPayload::Candidate(Some(CandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn end_of_candidates_detection() {
        let empty = CandidateInit::default();
        assert!(empty.is_end_of_candidates());
        let real = CandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
            ..Default::default()
        };
        assert!(!real.is_end_of_candidates());
    }

    #[test]
    fn server_roster_parses_with_and_without_turn() {
        let bare: ServerMessage =
            serde_json::from_str(r#"{"type":"room_peers","peers":["a","b"]}"#).unwrap();
        match bare {
            ServerMessage::RoomPeers { peers, turn } => {
                assert_eq!(peers, vec!["a".to_string(), "b".to_string()]);
                assert!(turn.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let with_turn: ServerMessage = serde_json::from_str(
            r#"{"type":"room_peers","peers":[],"turn":{"urls":["turn:relay.example.org:3478"],"username":"u","password":"p"}}"#,
        )
        .unwrap();
        match with_turn {
            ServerMessage::RoomPeers { turn: Some(t), .. } => {
                assert_eq!(t.urls, vec!["turn:relay.example.org:3478".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
