//! # sync-types
//!
//! Wire format types for the duplex-sync replication protocol.
//!
//! This crate provides the foundational types used across all duplex-sync crates:
//! - [`Encoder`], [`Decoder`] - lib0-compatible varint primitives
//! - [`Frame`], [`SyncMessage`], [`MessageType`] - protocol frames
//! - [`PeerId`], [`ClientId`] - identity types
//! - [`FrameError`] - decoding errors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
mod error;
mod frame;
mod ids;

pub use codec::{Decoder, Encoder};
pub use error::FrameError;
pub use frame::{Frame, MessageType, SyncMessage};
pub use ids::{ClientId, PeerId};
