//! Perfect-negotiation state machine for one peer.
//!
//! Both sides may start an offer at any time; the politeness role
//! decides who yields when the offers collide. The polite side rolls
//! its own offer back and answers the remote one, the impolite side
//! ignores the colliding offer (and any candidate failures it drags
//! along) and waits for its own offer to be answered.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::call::registry::PeerEntry;
use crate::engine::SignalingState;
use crate::protocol::signaling::{CandidateInit, SessionDescription, SignalPayload};
use crate::signaling::SignalSink;
use crate::CallError;

/// What the controller should do after a remote description was
/// processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptionOutcome {
    Handled,
    /// Dropped by the impolite side of an offer collision.
    Ignored,
    /// The connection is wedged (or the remote asked for it): tear the
    /// pair down and rebuild.
    Reset,
}

/// The connection asked for (re)negotiation: produce a local
/// description and ship it, unless this side is holding back after a
/// reset.
pub(crate) async fn handle_negotiation_needed(
    peer_id: &str,
    entry: &mut PeerEntry,
    signals: &dyn SignalSink,
) -> Result<(), CallError> {
    if entry.flags.suppressing_initial_offer {
        debug!(target = "call", peer = %peer_id, "holding back initial offer");
        return Ok(());
    }
    let session = Arc::clone(&entry.session);
    entry.flags.making_offer = true;

    if let Err(err) = session.set_local_description_implicit().await {
        debug!(target = "call", peer = %peer_id, error = %err, "implicit local description failed, creating offer explicitly");
        match session.create_offer().await {
            Ok(offer) => {
                if let Err(err) = session.set_local_description(offer).await {
                    warn!(target = "call", peer = %peer_id, error = %err, "failed to apply local offer");
                }
            }
            Err(err) => {
                warn!(target = "call", peer = %peer_id, error = %err, "failed to create offer");
            }
        }
    }

    // Ship whatever local description we ended up with; the flag drops
    // regardless of how the steps above went.
    let result = match session.local_description().await {
        Some(desc) => signals.send_signal(peer_id, SignalPayload::Description(desc)),
        None => Ok(()),
    };
    entry.flags.making_offer = false;
    result
}

/// Apply a remote description, arbitrating offer collisions by
/// politeness.
pub(crate) async fn handle_remote_description(
    peer_id: &str,
    entry: &mut PeerEntry,
    signals: &dyn SignalSink,
    desc: SessionDescription,
) -> Result<DescriptionOutcome, CallError> {
    if desc.is_reset() {
        debug!(target = "call", peer = %peer_id, "remote requested a reset");
        return Ok(DescriptionOutcome::Reset);
    }

    let session = Arc::clone(&entry.session);
    let state = session.signaling_state().await;
    let ready_for_offer = !entry.flags.making_offer
        && (state == SignalingState::Stable || entry.flags.setting_remote_answer_pending);
    let offer_collision = desc.is_offer() && !ready_for_offer;

    entry.flags.ignoring_offer = !entry.polite && offer_collision;
    if entry.flags.ignoring_offer {
        debug!(target = "call", peer = %peer_id, "ignoring colliding offer");
        return Ok(DescriptionOutcome::Ignored);
    }

    let is_offer = desc.is_offer();
    entry.flags.setting_remote_answer_pending = desc.is_answer();
    if let Err(err) = session.set_remote_description(desc).await {
        warn!(target = "call", peer = %peer_id, error = %err, "remote description rejected, resetting connection");
        entry.flags.setting_remote_answer_pending = false;
        return Ok(DescriptionOutcome::Reset);
    }
    entry.flags.setting_remote_answer_pending = false;

    if is_offer {
        if let Err(err) = session.set_local_description_implicit().await {
            debug!(target = "call", peer = %peer_id, error = %err, "implicit local description failed, creating answer explicitly");
            match session.create_answer().await {
                Ok(answer) => {
                    if let Err(err) = session.set_local_description(answer).await {
                        warn!(target = "call", peer = %peer_id, error = %err, "failed to apply local answer");
                    }
                }
                Err(err) => {
                    warn!(target = "call", peer = %peer_id, error = %err, "failed to create answer");
                }
            }
        }
        if let Some(local) = session.local_description().await {
            signals.send_signal(peer_id, SignalPayload::Description(local))?;
        }
        // An applied remote offer means the other side is driving;
        // nothing left to hold back.
        entry.flags.suppressing_initial_offer = false;
    }
    Ok(DescriptionOutcome::Handled)
}

/// Feed a remote candidate to the session. Failures are swallowed only
/// when this side is ignoring a colliding offer and the candidate
/// carries real content; every other failure surfaces to the caller.
pub(crate) async fn handle_remote_candidate(
    peer_id: &str,
    entry: &mut PeerEntry,
    candidate: Option<CandidateInit>,
) -> Result<(), CallError> {
    let meaningful = candidate
        .as_ref()
        .is_some_and(|c| !c.is_end_of_candidates());
    let session = Arc::clone(&entry.session);
    if let Err(err) = session.add_remote_candidate(candidate).await {
        if entry.flags.ignoring_offer && meaningful {
            trace!(target = "call", peer = %peer_id, error = %err, "candidate failure suppressed while ignoring offer");
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}
