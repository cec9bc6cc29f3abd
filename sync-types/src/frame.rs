//! Frames exchanged between peers of a room.
//!
//! Construction of a frame:
//!
//! ```text
//! [tag: varuint][payload...]
//!
//! Sync              (0): [sync tag: varuint][bytes: varbytes]
//!                        sync tag 0 = Step1 (state vector)
//!                        sync tag 1 = Step2 (update answering a Step1)
//!                        sync tag 2 = Update (live update)
//! Awareness         (1): [update: varbytes]
//! QueryAwareness    (3): (empty)
//! PresenceAnnounce  (4): [add: u8][peer id: varstring]
//! ```
//!
//! A frame never names its room. Transports only deliver frames inside the
//! room they were sent on.

use crate::codec::{Decoder, Encoder};
use crate::FrameError;

/// Leading tag of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Document replication (see [`SyncMessage`]).
    Sync = 0,
    /// Awareness update.
    Awareness = 1,
    /// Request for a full awareness snapshot.
    QueryAwareness = 3,
    /// Same-device presence announcement.
    PresenceAnnounce = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = FrameError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            3 => Ok(MessageType::QueryAwareness),
            4 => Ok(MessageType::PresenceAnnounce),
            _ => Err(FrameError::UnknownMessageTag(value)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Sync => "sync",
            MessageType::Awareness => "awareness",
            MessageType::QueryAwareness => "query-awareness",
            MessageType::PresenceAnnounce => "presence",
        };
        f.write_str(name)
    }
}

mod sync_tag {
    pub const STEP1: u64 = 0;
    pub const STEP2: u64 = 1;
    pub const UPDATE: u64 = 2;
}

/// Document replication sub-protocol.
///
/// - **Step1** carries the sender's state vector. The receiver answers with
///   a Step2 containing everything the sender is missing.
/// - **Step2** carries that diff. The first Step2 received from a peer
///   marks the peer as synced.
/// - **Update** carries a live update and never changes synced state.
#[derive(Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector of the sender.
    Step1(Vec<u8>),
    /// Update answering a Step1.
    Step2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn tag(&self) -> u64 {
        match self {
            SyncMessage::Step1(_) => sync_tag::STEP1,
            SyncMessage::Step2(_) => sync_tag::STEP2,
            SyncMessage::Update(_) => sync_tag::UPDATE,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            SyncMessage::Step1(b) | SyncMessage::Step2(b) | SyncMessage::Update(b) => b,
        }
    }

    fn write(&self, enc: &mut Encoder) {
        enc.write_var_uint(self.tag());
        enc.write_var_bytes(self.bytes());
    }

    fn read(dec: &mut Decoder<'_>) -> Result<Self, FrameError> {
        let tag = dec.read_var_uint()?;
        let bytes = dec.read_var_bytes()?.to_vec();
        match tag {
            sync_tag::STEP1 => Ok(SyncMessage::Step1(bytes)),
            sync_tag::STEP2 => Ok(SyncMessage::Step2(bytes)),
            sync_tag::UPDATE => Ok(SyncMessage::Update(bytes)),
            other => Err(FrameError::UnknownSyncTag(other)),
        }
    }
}

// Payloads are opaque CRDT bytes; print sizes only.
impl std::fmt::Debug for SyncMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncMessage::Step1(_) => "Step1",
            SyncMessage::Step2(_) => "Step2",
            SyncMessage::Update(_) => "Update",
        };
        write!(f, "{}([{} bytes])", name, self.bytes().len())
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Document replication message.
    Sync(SyncMessage),
    /// Encoded awareness update.
    Awareness(Vec<u8>),
    /// Ask the receiver for its full awareness state.
    QueryAwareness,
    /// A same-device peer announcing (or withdrawing) itself.
    PresenceAnnounce {
        /// `true` when the peer joined, `false` when it left.
        add: bool,
        /// The announcing peer's presence id.
        peer_id: String,
    },
}

impl Frame {
    /// The leading tag this frame is encoded with.
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
            Frame::QueryAwareness => MessageType::QueryAwareness,
            Frame::PresenceAnnounce { .. } => MessageType::PresenceAnnounce,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.size_hint());
        enc.write_var_uint(self.message_type() as u64);
        match self {
            Frame::Sync(msg) => msg.write(&mut enc),
            Frame::Awareness(update) => enc.write_var_bytes(update),
            Frame::QueryAwareness => {}
            Frame::PresenceAnnounce { add, peer_id } => {
                enc.write_u8(u8::from(*add));
                enc.write_var_string(peer_id);
            }
        }
        enc.into_bytes()
    }

    /// Decode from wire bytes.
    ///
    /// Bytes after a complete frame are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut dec = Decoder::new(bytes);
        let tag = MessageType::try_from(dec.read_var_uint()?)?;
        let frame = match tag {
            MessageType::Sync => Frame::Sync(SyncMessage::read(&mut dec)?),
            MessageType::Awareness => Frame::Awareness(dec.read_var_bytes()?.to_vec()),
            MessageType::QueryAwareness => Frame::QueryAwareness,
            MessageType::PresenceAnnounce => {
                let add = dec.read_u8()? == 1;
                let peer_id = dec.read_var_string()?.to_string();
                Frame::PresenceAnnounce { add, peer_id }
            }
        };
        Ok(frame)
    }

    fn size_hint(&self) -> usize {
        // tag + sub-tag + up to 5 bytes of length prefix
        8 + match self {
            Frame::Sync(msg) => msg.bytes().len(),
            Frame::Awareness(update) => update.len(),
            Frame::QueryAwareness => 0,
            Frame::PresenceAnnounce { peer_id, .. } => peer_id.len(),
        }
    }
}
