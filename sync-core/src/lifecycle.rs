//! Room session lifecycle state machine.
//!
//! A pure, side-effect-free state machine for a room session. It takes
//! lifecycle requests as input and produces the next state plus the list of
//! actions the session must perform, in order.
//!
//! ```text
//!            connect              disconnect
//! Created ───────────▶ Connected ◀──────────▶ Disconnected
//!    │                     │        connect         │
//!    └──────── destroy ────┴────────────────────────┴──▶ Destroyed
//! ```
//!
//! The mesh is joined when the session is built, so the first connect does
//! not join it again. Every later connect does.

/// Lifecycle state of a room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoomState {
    /// Built, mesh joined, not yet connected.
    #[default]
    Created,
    /// Listeners and broadcast subscription active.
    Connected,
    /// Listeners dropped, mesh left.
    Disconnected,
    /// Terminal.
    Destroyed,
}

/// Lifecycle requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    /// Application or provider asked to connect.
    ConnectRequested,
    /// Application asked to disconnect, or the shutdown signal fired.
    DisconnectRequested,
    /// Application asked to destroy, or the document was destroyed.
    DestroyRequested,
}

/// Work the session performs for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomAction {
    /// Join the mesh again.
    JoinMesh,
    /// Start forwarding local document and awareness changes.
    SubscribeLocalChanges,
    /// Subscribe to the same-device broadcast channel.
    SubscribeBroadcast,
    /// Announce the local presence id on the broadcast channel.
    AnnouncePresence,
    /// Publish Step1, a full Step2, QueryAwareness and the local awareness
    /// entry on the broadcast channel.
    SendInitialSync,
    /// Tombstone the local awareness client and tell everyone.
    RemoveLocalAwareness,
    /// Announce presence removal on the broadcast channel.
    WithdrawPresence,
    /// Drop the broadcast subscription.
    UnsubscribeBroadcast,
    /// Stop forwarding local changes.
    UnsubscribeLocalChanges,
    /// Leave the mesh and forget every tracked peer.
    LeaveMesh,
    /// Stop watching the process shutdown signal.
    ReleaseShutdownHook,
    /// Report the connection status to the application.
    EmitStatus {
        /// New status.
        connected: bool,
    },
}

const CONNECT: [RoomAction; 5] = [
    RoomAction::SubscribeLocalChanges,
    RoomAction::SubscribeBroadcast,
    RoomAction::AnnouncePresence,
    RoomAction::SendInitialSync,
    RoomAction::EmitStatus { connected: true },
];

const DISCONNECT: [RoomAction; 6] = [
    RoomAction::RemoveLocalAwareness,
    RoomAction::WithdrawPresence,
    RoomAction::UnsubscribeBroadcast,
    RoomAction::UnsubscribeLocalChanges,
    RoomAction::LeaveMesh,
    RoomAction::EmitStatus { connected: false },
];

impl RoomState {
    /// Create a new state machine in the Created state.
    pub fn new() -> Self {
        Self::Created
    }

    /// Process a request and return the new state plus actions to execute.
    ///
    /// Requests that make no sense in the current state (connecting twice,
    /// disconnecting while disconnected, anything after destroy) leave the
    /// state unchanged and produce no actions.
    pub fn on_event(self, event: RoomEvent) -> (Self, Vec<RoomAction>) {
        match (self, event) {
            (Self::Created, RoomEvent::ConnectRequested) => (Self::Connected, CONNECT.to_vec()),
            (Self::Disconnected, RoomEvent::ConnectRequested) => {
                let mut actions = vec![RoomAction::JoinMesh];
                actions.extend(CONNECT);
                (Self::Connected, actions)
            }

            (Self::Connected, RoomEvent::DisconnectRequested) => {
                (Self::Disconnected, DISCONNECT.to_vec())
            }
            // Never connected, but the mesh is already joined.
            (Self::Created, RoomEvent::DisconnectRequested) => {
                (Self::Disconnected, vec![RoomAction::LeaveMesh])
            }

            (Self::Connected, RoomEvent::DestroyRequested) => {
                let mut actions = DISCONNECT.to_vec();
                actions.push(RoomAction::ReleaseShutdownHook);
                (Self::Destroyed, actions)
            }
            (Self::Created, RoomEvent::DestroyRequested) => (
                Self::Destroyed,
                vec![RoomAction::LeaveMesh, RoomAction::ReleaseShutdownHook],
            ),
            (Self::Disconnected, RoomEvent::DestroyRequested) => {
                (Self::Destroyed, vec![RoomAction::ReleaseShutdownHook])
            }

            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the session has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed)
    }
}
