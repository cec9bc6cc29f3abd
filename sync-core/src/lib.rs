//! # sync-core
//!
//! Pure logic for duplex-sync (no I/O, instant tests).
//!
//! This crate holds the decisions a room session makes, without any
//! network, broadcast channel or document access:
//! - [`PeerTracker`] - remote and same-device peers, aggregate synced state
//! - [`RoomState`] - session lifecycle as a state machine
//! - [`route`] - which transports a frame goes out on
//!
//! Every module takes input and produces output without side effects. The
//! I/O is performed by `sync-client`, which interprets the events and
//! actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod fanout;
pub mod lifecycle;
pub mod peers;

pub use fanout::{route, Delivery, Links, MeshTarget, Route};
pub use lifecycle::{RoomAction, RoomEvent, RoomState};
pub use peers::{PeerTracker, PresenceOutcome, RemotePeer, TrackerEvent};
