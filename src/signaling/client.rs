//! WebSocket signaling client.
//!
//! One connection per call: a writer task drains an unbounded outbound
//! queue, a reader task converts relay frames into [`RoomEvent`]s, and
//! a heartbeat task keeps intermediaries from idling the socket out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use crate::protocol::signaling::{ClientMessage, ServerMessage, SignalPayload};
use crate::signaling::{RoomEvent, SignalSink};
use crate::CallError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct SignalingClient {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to the relay and join `room`. Room events start flowing
    /// on the returned receiver immediately.
    pub async fn connect(
        base_url: &str,
        room: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RoomEvent>), CallError> {
        let url = derive_websocket_url(base_url, room)?;
        debug!(target = "signaling", url = %url, "connecting to relay");
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| CallError::Signaling(format!("connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (room_tx, room_rx) = mpsc::unbounded_channel::<RoomEvent>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(target = "signaling", error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = ws_write.send(Message::Text(json)).await {
                    warn!(target = "signaling", error = %err, "websocket send failed");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text)
                    {
                        Ok(message) => {
                            if let Some(event) = room_event_from(message) {
                                if room_tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            warn!(target = "signaling", error = %err, "unparseable relay frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target = "signaling", error = %err, "websocket read failed");
                        break;
                    }
                }
            }
            let _ = room_tx.send(RoomEvent::Closed);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let client = Arc::new(Self {
            send_tx,
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        });
        Ok((client, room_rx))
    }

    fn abort_tasks(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl SignalSink for SignalingClient {
    fn send_signal(&self, to_peer: &str, payload: SignalPayload) -> Result<(), CallError> {
        trace!(target = "signaling", to = %to_peer, "queueing signal");
        self.send_tx
            .send(ClientMessage::Signal {
                to_peer: to_peer.to_string(),
                payload,
            })
            .map_err(|_| CallError::ChannelClosed)
    }

    fn close(&self) {
        self.abort_tasks();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn room_event_from(message: ServerMessage) -> Option<RoomEvent> {
    match message {
        ServerMessage::RoomJoined { peer_id } => Some(RoomEvent::Joined { self_id: peer_id }),
        ServerMessage::RoomPeers { peers, turn } => Some(RoomEvent::Roster { peers, turn }),
        ServerMessage::PeerJoined { peer_id } => Some(RoomEvent::PeerJoined { peer_id }),
        ServerMessage::PeerLeft { peer_id } => Some(RoomEvent::PeerLeft { peer_id }),
        ServerMessage::Signal { from_peer, payload } => {
            Some(RoomEvent::Signal { from_peer, payload })
        }
        ServerMessage::Pong => None,
        ServerMessage::Error { message } => {
            warn!(target = "signaling", %message, "relay reported an error");
            None
        }
    }
}

/// Accepts http(s) or ws(s) base URLs and produces the room endpoint,
/// e.g. `https://relay.example.org` -> `wss://relay.example.org/rooms/<room>`.
fn derive_websocket_url(base_url: &str, room: &str) -> Result<Url, CallError> {
    let mut url = Url::parse(base_url)
        .map_err(|err| CallError::Setup(format!("invalid signaling url {base_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(CallError::Setup(format!(
                "unsupported signaling scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| CallError::Setup("failed to set websocket scheme".to_string()))?;
    url.set_path(&format!("/rooms/{room}"));
    Ok(url)
}
