//! Call configuration.

use rand::Rng;

use crate::engine::TrackSpec;
use crate::protocol::signaling::TurnCredentials;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Base URL of the signaling relay, e.g. `ws://127.0.0.1:8080`.
    pub signaling_url: String,
    pub room: String,
    pub display_name: Option<String>,
    pub ice_servers: Vec<IceServer>,
    /// Local media attached to every peer connection.
    pub tracks: Vec<TrackSpec>,
}

impl CallConfig {
    pub fn new(signaling_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            room: room.into(),
            display_name: None,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            tracks: vec![TrackSpec::audio("mic"), TrackSpec::video("camera")],
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_tracks(mut self, tracks: Vec<TrackSpec>) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn add_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn add_turn_server(mut self, credentials: &TurnCredentials) -> Self {
        self.ice_servers.push(IceServer {
            urls: credentials.urls.clone(),
            username: Some(credentials.username.clone()),
            credential: Some(credentials.password.clone()),
        });
        self
    }
}

/// Random room name in `xxxx-xxxx-xxxx` form, lowercase alphabetic.
pub fn generate_room_name() -> String {
    let mut rng = rand::thread_rng();
    let mut group = || -> String {
        (0..4)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect()
    };
    format!("{}-{}-{}", group(), group(), group())
}
