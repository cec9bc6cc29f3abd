//! Transport abstraction for duplex-sync.
//!
//! A room talks over two independent transports:
//!
//! - the **mesh** reaches remote peers. [`MeshConnector::join`] returns a
//!   [`MeshHandle`]: a [`MeshTransport`] for sending plus a stream of
//!   [`MeshEvent`]s (peer joined, peer left, message). The mesh is assumed to
//!   secure its own links, so frames travel unencrypted.
//! - the **broadcast channel** reaches other sessions on the same device.
//!   [`BroadcastChannel::subscribe`] returns a [`BroadcastSubscription`];
//!   publishing through it never delivers back to that subscription.
//!   Dropping the subscription's receiver unsubscribes.
//!
//! Neither transport acknowledges, orders across peers, or retries.
//!
//! # Example
//!
//! ```ignore
//! let network = MemoryMesh::new();
//! let MeshHandle { transport, mut events } = network.join("room", &MeshOptions::default()).await?;
//! transport.send(&frame_bytes, None).await?;
//! while let Some(event) = events.recv().await { /* ... */ }
//! ```

mod memory;

pub use memory::{MemoryBroadcast, MemoryMesh, SentFrame};

use async_trait::async_trait;
use duplex_sync_types::PeerId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Joining the mesh or subscribing to the channel failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The handle was used after leaving.
    #[error("not connected")]
    NotConnected,

    /// The addressed mesh peer is not connected.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Something that happened on the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A remote peer connected.
    PeerJoined(PeerId),
    /// A remote peer went away.
    PeerLeft(PeerId),
    /// A remote peer sent bytes.
    Message {
        /// Sender.
        from: PeerId,
        /// Encoded frame.
        bytes: Vec<u8>,
    },
}

/// Options passed to the mesh when joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshOptions {
    /// Application namespace.
    pub app_id: String,
    /// Upper bound on simultaneous peer connections. A hint; backends may
    /// ignore it.
    pub max_conns: usize,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            app_id: crate::config::DEFAULT_APP_ID.to_string(),
            max_conns: crate::config::default_max_conns(),
        }
    }
}

/// Sending half of a joined mesh.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Our id as seen by other mesh peers.
    fn local_id(&self) -> &PeerId;

    /// Send to one peer, or to every connected peer when `peer` is `None`.
    async fn send(&self, bytes: &[u8], peer: Option<&PeerId>) -> Result<(), TransportError>;

    /// Leave the mesh. Remote peers observe [`MeshEvent::PeerLeft`].
    async fn leave(&self) -> Result<(), TransportError>;
}

/// A joined mesh.
pub struct MeshHandle {
    /// Sending half.
    pub transport: Arc<dyn MeshTransport>,
    /// Events in delivery order. Ends when the handle leaves.
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
}

impl std::fmt::Debug for MeshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshHandle")
            .field("local_id", self.transport.local_id())
            .finish_non_exhaustive()
    }
}

/// Capability to join a mesh room. One implementation per backend.
#[async_trait]
pub trait MeshConnector: Send + Sync {
    /// Join the mesh room `room`.
    async fn join(&self, room: &str, options: &MeshOptions) -> Result<MeshHandle, TransportError>;
}

/// Publishing half of a broadcast subscription.
#[async_trait]
pub trait BroadcastSender: Send + Sync {
    /// Publish to every other subscriber of the channel.
    async fn publish(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// An active broadcast-channel subscription.
pub struct BroadcastSubscription {
    /// Publishes on behalf of this subscription.
    pub sender: Arc<dyn BroadcastSender>,
    /// Messages published by other subscribers.
    pub messages: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl std::fmt::Debug for BroadcastSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSubscription").finish_non_exhaustive()
    }
}

/// Same-device named publish/subscribe channel.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Subscribe to the channel called `name`.
    async fn subscribe(&self, name: &str) -> Result<BroadcastSubscription, TransportError>;
}
