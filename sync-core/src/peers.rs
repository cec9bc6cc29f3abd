//! Peer and presence tracking.
//!
//! [`PeerTracker`] owns the set of remote (mesh) peers with their per-peer
//! synced flag, the set of same-device peers discovered through presence
//! announcements, and the room-wide aggregate synced state.
//!
//! Every operation is idempotent and returns the [`TrackerEvent`]s it caused.
//! Repeating an operation produces no events, so callers can forward the
//! events to the application without deduplicating.

use duplex_sync_types::PeerId;
use std::collections::{BTreeMap, BTreeSet};

/// A peer reachable over the mesh transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    /// Transport-assigned id.
    pub id: PeerId,
    /// True once the first Step2 from this peer has been applied.
    pub synced: bool,
}

/// Observable changes produced by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The set of known peers changed.
    PeersChanged {
        /// Peers that appeared.
        added: Vec<PeerId>,
        /// Peers that went away.
        removed: Vec<PeerId>,
        /// Current mesh peers after the change.
        mesh_peers: Vec<PeerId>,
        /// Current same-device peers after the change.
        local_peers: Vec<PeerId>,
    },
    /// The room-wide synced state flipped.
    SyncedChanged {
        /// The new aggregate value.
        synced: bool,
    },
}

/// Result of handling a presence announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceOutcome {
    /// Events to forward to the application.
    pub events: Vec<TrackerEvent>,
    /// True when the local peer should announce itself again so the
    /// newcomer learns about it.
    pub reannounce: bool,
}

/// Tracks remote peers, same-device peers and the aggregate synced state.
#[derive(Debug, Clone)]
pub struct PeerTracker {
    self_id: PeerId,
    remote: BTreeMap<PeerId, RemotePeer>,
    local: BTreeSet<PeerId>,
    synced: bool,
}

impl PeerTracker {
    /// Create an empty tracker for the local presence id.
    ///
    /// The reported synced state starts out `false` and only changes when
    /// a join, leave or synced transition forces a recomputation.
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            remote: BTreeMap::new(),
            local: BTreeSet::new(),
            synced: false,
        }
    }

    /// A mesh peer connected.
    pub fn on_peer_join(&mut self, id: PeerId) -> Vec<TrackerEvent> {
        if self.remote.contains_key(&id) {
            return Vec::new();
        }
        self.remote.insert(
            id.clone(),
            RemotePeer {
                id: id.clone(),
                synced: false,
            },
        );
        let mut events = vec![self.peers_changed(vec![id], Vec::new())];
        events.extend(self.recompute());
        events
    }

    /// A mesh peer disconnected.
    ///
    /// The peer is dropped from tracking entirely before the aggregate is
    /// recomputed.
    pub fn on_peer_leave(&mut self, id: &PeerId) -> Vec<TrackerEvent> {
        if self.remote.remove(id).is_none() {
            return Vec::new();
        }
        let mut events = vec![self.peers_changed(Vec::new(), vec![id.clone()])];
        events.extend(self.recompute());
        events
    }

    /// A mesh peer delivered its first Step2.
    pub fn on_peer_synced(&mut self, id: &PeerId) -> Vec<TrackerEvent> {
        match self.remote.get_mut(id) {
            Some(peer) if !peer.synced => {
                peer.synced = true;
                self.recompute()
            }
            _ => Vec::new(),
        }
    }

    /// A same-device peer announced (`add = true`) or withdrew itself.
    pub fn on_presence(&mut self, add: bool, id: PeerId) -> PresenceOutcome {
        if id == self.self_id {
            return PresenceOutcome::default();
        }
        let changed = if add {
            self.local.insert(id.clone())
        } else {
            self.local.remove(&id)
        };
        if !changed {
            return PresenceOutcome::default();
        }

        let (added, removed) = if add {
            (vec![id], Vec::new())
        } else {
            (Vec::new(), vec![id])
        };
        PresenceOutcome {
            events: vec![self.peers_changed(added, removed)],
            reannounce: true,
        }
    }

    /// Forget every peer, e.g. after leaving the mesh.
    ///
    /// Behaves as a leave of every tracked peer at once: the aggregate is
    /// recomputed over the now empty set.
    pub fn reset(&mut self) -> Vec<TrackerEvent> {
        let mut removed: Vec<PeerId> = self.remote.keys().cloned().collect();
        removed.extend(self.local.iter().cloned());
        self.remote.clear();
        self.local.clear();

        let mut events = Vec::new();
        if !removed.is_empty() {
            events.push(self.peers_changed(Vec::new(), removed));
        }
        events.extend(self.recompute());
        events
    }

    /// True iff every tracked remote peer is synced (vacuously true when
    /// there are none).
    pub fn aggregate_synced(&self) -> bool {
        self.remote.values().all(|peer| peer.synced)
    }

    /// The last aggregate value reported through a `SyncedChanged` event.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Look up a tracked mesh peer.
    pub fn remote_peer(&self, id: &PeerId) -> Option<&RemotePeer> {
        self.remote.get(id)
    }

    /// Ids of the tracked mesh peers, in sorted order.
    pub fn mesh_peers(&self) -> Vec<PeerId> {
        self.remote.keys().cloned().collect()
    }

    /// Ids of the known same-device peers, in sorted order.
    pub fn local_peers(&self) -> Vec<PeerId> {
        self.local.iter().cloned().collect()
    }

    fn recompute(&mut self) -> Vec<TrackerEvent> {
        let synced = self.aggregate_synced();
        if synced == self.synced {
            return Vec::new();
        }
        self.synced = synced;
        vec![TrackerEvent::SyncedChanged { synced }]
    }

    fn peers_changed(&self, added: Vec<PeerId>, removed: Vec<PeerId>) -> TrackerEvent {
        TrackerEvent::PeersChanged {
            added,
            removed,
            mesh_peers: self.mesh_peers(),
            local_peers: self.local_peers(),
        }
    }
}
