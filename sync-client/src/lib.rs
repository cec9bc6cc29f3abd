//! # sync-client
//!
//! Peer-to-peer CRDT document sync for duplex-sync.
//!
//! A [`Provider`] keeps one document in sync with every other session of
//! the same room, over two transports at once:
//!
//! - **Mesh**: remote peers, through a pluggable [`MeshConnector`]
//! - **Broadcast channel**: other sessions on the same device, encrypted
//!   with a key derived from the room password
//!
//! ## Features
//!
//! - **Yjs-compatible wire protocol**: sync step1/step2/update and awareness
//! - **Device-Adaptive Key Derivation**: Argon2id scales with available RAM
//! - **Transport Abstraction**: in-memory mesh and broadcast hub included
//! - **Pure State Machine**: lifecycle and peer tracking come from sync-core
//!
//! ## Example
//!
//! ```ignore
//! use duplex_sync_client::{Provider, ProviderConfig, ProviderContext, YrsDocument};
//!
//! let doc = Arc::new(YrsDocument::new());
//! let provider = Provider::new(ProviderConfig::new("notes"), doc.clone(), ctx).await?;
//!
//! doc.push_text("hello");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod awareness;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod provider;
pub mod registry;
pub mod room;
pub mod transport;

pub use awareness::{Awareness, AwarenessChange, AwarenessError, AwarenessOrigin};
pub use config::{ConfigError, ProviderConfig, DEFAULT_APP_ID};
pub use crypto::{Argon2Params, CryptoError, RoomKey, KEY_SIZE, NONCE_SIZE};
pub use dispatch::{dispatch, DispatchOutcome};
pub use document::{Document, DocumentError, UpdateSubscription, YrsDocument};
pub use error::ProviderError;
pub use provider::{Provider, ProviderContext};
pub use registry::{RegistryError, Reservation, RoomHandle, RoomRegistry};
pub use room::{ProviderEvent, Room, RoomSetup};
pub use transport::{
    BroadcastChannel, BroadcastSender, BroadcastSubscription, MemoryBroadcast, MemoryMesh,
    MeshConnector, MeshEvent, MeshHandle, MeshOptions, MeshTransport, SentFrame, TransportError,
};
