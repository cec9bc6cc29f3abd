//! Transport fan-out routing.
//!
//! Decides which transports a frame goes out on. The session executes the
//! resulting [`Route`]: the broadcast half is encrypted with the room key
//! (if any) and published, the mesh half is sent unencrypted.

use duplex_sync_types::{MessageType, PeerId};

/// Where a frame is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Every transport and every peer.
    Room,
    /// The same-device broadcast channel only.
    Broadcast,
    /// A single mesh peer.
    Peer(PeerId),
}

/// Link availability at the time a frame is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Links {
    /// The broadcast subscription is active.
    pub broadcast: bool,
    /// A mesh connection exists.
    pub mesh: bool,
    /// Presence announcements are enabled (`filter_bc_conns`).
    pub announce_presence: bool,
}

/// Mesh addressing of a routed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshTarget {
    /// Send to every connected mesh peer.
    All,
    /// Send to one mesh peer.
    Peer(PeerId),
}

/// Routing decision for one frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Route {
    /// Publish on the broadcast channel.
    pub broadcast: bool,
    /// Send over the mesh.
    pub mesh: Option<MeshTarget>,
}

impl Route {
    /// The frame goes nowhere.
    pub fn is_empty(&self) -> bool {
        !self.broadcast && self.mesh.is_none()
    }
}

/// Route a frame of kind `kind` addressed to `delivery`.
///
/// Presence announcements never touch the mesh and are suppressed entirely
/// when announcements are disabled.
pub fn route(kind: MessageType, delivery: &Delivery, links: Links) -> Route {
    if kind == MessageType::PresenceAnnounce {
        let broadcast =
            links.announce_presence && links.broadcast && !matches!(delivery, Delivery::Peer(_));
        return Route {
            broadcast,
            mesh: None,
        };
    }

    match delivery {
        Delivery::Room => Route {
            broadcast: links.broadcast,
            mesh: links.mesh.then_some(MeshTarget::All),
        },
        Delivery::Broadcast => Route {
            broadcast: links.broadcast,
            mesh: None,
        },
        Delivery::Peer(id) => Route {
            broadcast: false,
            mesh: links.mesh.then(|| MeshTarget::Peer(id.clone())),
        },
    }
}
