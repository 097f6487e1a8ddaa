//! Per-peer connection registry.
//!
//! One entry per remote peer, keyed by the relay-assigned identifier.
//! The entry bundles the media session with the negotiation flags and
//! politeness role that govern it; all of it is recreated together on
//! reset.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{EngineEvent, MediaEngine, MediaSession};
use crate::protocol::signaling::PeerId;
use crate::CallError;

/// Mutable negotiation state for one peer. Only the controller task
/// touches these, so plain fields suffice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiationFlags {
    /// An offer of ours is in flight (set across the local-description
    /// rollup, cleared when the offer has been sent).
    pub making_offer: bool,
    /// We are the impolite side of a live offer collision; incoming
    /// offers and their candidate failures are dropped.
    pub ignoring_offer: bool,
    /// A remote answer is mid-application; `stable` is imminent.
    pub setting_remote_answer_pending: bool,
    /// Post-reset politeness: skip the first negotiation-needed so the
    /// other side leads with the offer.
    pub suppressing_initial_offer: bool,
}

pub struct PeerEntry {
    pub session: Arc<dyn MediaSession>,
    /// True when we yield on offer collision. Fixed at discovery time
    /// and preserved across resets.
    pub polite: bool,
    pub flags: NegotiationFlags,
    /// Last display name announced to this peer, to avoid re-announcing.
    pub announced_name: Option<String>,
}

pub struct PeerRegistry {
    engine: Arc<dyn MediaEngine>,
    engine_events: mpsc::UnboundedSender<EngineEvent>,
    entries: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        engine_events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            engine,
            engine_events,
            entries: HashMap::new(),
        }
    }

    /// Create a fresh entry for `peer_id`, closing and replacing any
    /// existing one. Flags start cleared.
    pub async fn create(
        &mut self,
        peer_id: &str,
        polite: bool,
    ) -> Result<&mut PeerEntry, CallError> {
        if let Some(old) = self.entries.remove(peer_id) {
            debug!(target = "call", peer = %peer_id, "replacing existing connection");
            old.session.close().await;
        }
        let session = self
            .engine
            .create_session(peer_id, self.engine_events.clone())
            .await?;
        let entry = self
            .entries
            .entry(peer_id.to_string())
            .or_insert(PeerEntry {
                session,
                polite,
                flags: NegotiationFlags::default(),
                announced_name: None,
            });
        Ok(entry)
    }

    /// Close and forget the entry. Returns false when the peer was
    /// unknown.
    pub async fn destroy(&mut self, peer_id: &str) -> bool {
        match self.entries.remove(peer_id) {
            Some(entry) => {
                entry.session.close().await;
                true
            }
            None => false,
        }
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerEntry> {
        self.entries.get_mut(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.entries.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every entry and clear the registry.
    pub async fn destroy_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    fn registry_with_engine() -> (Arc<MockEngine>, PeerRegistry) {
        let engine = MockEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(engine.clone(), tx);
        (engine, registry)
    }

    #[tokio::test]
    async fn create_records_politeness_and_clears_flags() {
        let (_engine, mut registry) = registry_with_engine();
        let entry = registry.create("p1", true).await.unwrap();
        assert!(entry.polite);
        assert!(!entry.flags.making_offer);
        assert!(!entry.flags.suppressing_initial_offer);
        assert!(entry.announced_name.is_none());
    }

    #[tokio::test]
    async fn recreating_closes_the_previous_session() {
        let (engine, mut registry) = registry_with_engine();
        registry.create("p1", false).await.unwrap();
        registry.create("p1", false).await.unwrap();

        let sessions = engine.sessions_for("p1");
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].is_closed());
        assert!(!sessions[1].is_closed());
        assert_eq!(registry.peer_ids(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn destroy_closes_and_forgets() {
        let (engine, mut registry) = registry_with_engine();
        registry.create("p1", true).await.unwrap();
        assert!(registry.destroy("p1").await);
        assert!(!registry.destroy("p1").await);
        assert!(registry.is_empty());
        assert!(engine.session("p1").unwrap().is_closed());
    }
}
