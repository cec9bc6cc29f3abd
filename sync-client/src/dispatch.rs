//! Inbound frame dispatch.
//!
//! Decodes one inbound frame, applies it to the document or awareness, and
//! reports what the session has to do next: send a reply, mark the sender
//! synced, or record a presence announcement. The dispatcher never sends
//! anything itself and keeps no state between frames.

use crate::awareness::{Awareness, AwarenessOrigin};
use crate::document::Document;
use duplex_sync_types::{Frame, FrameError, PeerId, SyncMessage};
use tracing::{debug, error, warn};

/// What a dispatched frame asks of the session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Frame to send back to the sender, on the transport it came from.
    pub reply: Option<Frame>,
    /// The frame was a Step2.
    pub step2_received: bool,
    /// The frame was a presence announcement: `(add, peer id)`.
    pub presence: Option<(bool, PeerId)>,
}

/// Decode and handle `bytes`.
///
/// Frame errors are returned so the caller can log and drop the frame.
/// Failures while applying a decoded frame are logged here and do not
/// change the outcome: a Step2 that fails to apply still counts as
/// received.
pub fn dispatch(
    room: &str,
    bytes: &[u8],
    doc: &dyn Document,
    awareness: &Awareness,
) -> Result<DispatchOutcome, FrameError> {
    let frame = Frame::decode(bytes)?;
    debug!(room, tag = %frame.message_type(), "dispatching frame");

    let mut outcome = DispatchOutcome::default();
    match frame {
        Frame::Sync(SyncMessage::Step1(state_vector)) => {
            match doc.encode_state_as_update(&state_vector) {
                Ok(update) => outcome.reply = Some(Frame::Sync(SyncMessage::Step2(update))),
                Err(e) => warn!(room, error = %e, "cannot answer step1"),
            }
        }
        Frame::Sync(SyncMessage::Step2(update)) => {
            if let Err(e) = doc.apply_update(&update) {
                error!(room, error = %e, "failed to apply step2");
            }
            outcome.step2_received = true;
        }
        Frame::Sync(SyncMessage::Update(update)) => {
            if let Err(e) = doc.apply_update(&update) {
                error!(room, error = %e, "failed to apply update");
            }
        }
        Frame::Awareness(update) => {
            if let Err(e) = awareness.apply_update(&update, AwarenessOrigin::Remote) {
                warn!(room, error = %e, "dropping awareness update");
            }
        }
        Frame::QueryAwareness => {
            outcome.reply = Some(Frame::Awareness(awareness.encode_all()));
        }
        Frame::PresenceAnnounce { add, peer_id } => {
            outcome.presence = Some((add, PeerId::new(peer_id)));
        }
    }
    Ok(outcome)
}
