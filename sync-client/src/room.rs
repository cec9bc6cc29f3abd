//! Room session.
//!
//! A [`Room`] binds one document and its awareness to one room name over
//! two transports: the mesh (remote peers) and the same-device broadcast
//! channel. It interprets the pure lifecycle machine from
//! `duplex_sync_core` and executes its actions:
//!
//! ```text
//! Application → Room → RoomState (pure) → actions
//!                 ↓
//!   MeshTransport / BroadcastSender / Document / Awareness
//! ```
//!
//! Every inbound source is pumped by a spawned task that holds only a weak
//! reference to the room. Disconnecting aborts the pumps.
//!
//! Locking: `ops` serializes lifecycle transitions. `bc` serializes
//! broadcast-channel processing and publishing; it may be taken before
//! `state`, never after. `state` is held only for short sections with no
//! awaits.

use crate::awareness::{Awareness, AwarenessOrigin};
use crate::crypto::RoomKey;
use crate::dispatch::dispatch;
use crate::document::{Document, UpdateSubscription};
use crate::error::ProviderError;
use crate::registry::RoomHandle;
use crate::transport::{
    BroadcastChannel, BroadcastSender, BroadcastSubscription, MeshConnector, MeshEvent, MeshHandle,
    MeshOptions, MeshTransport,
};
use async_trait::async_trait;
use duplex_sync_core::{
    route, Delivery, Links, MeshTarget, PeerTracker, RoomAction, RoomEvent, RoomState,
    TrackerEvent,
};
use duplex_sync_types::{Frame, PeerId, SyncMessage};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Events reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The room connected or disconnected.
    Status {
        /// New status.
        connected: bool,
    },
    /// The room-wide synced state flipped.
    Synced {
        /// New value.
        synced: bool,
    },
    /// Known peers changed.
    Peers {
        /// Peers that appeared.
        added: Vec<PeerId>,
        /// Peers that went away.
        removed: Vec<PeerId>,
        /// Current mesh peers.
        mesh_peers: Vec<PeerId>,
        /// Current same-device peers.
        local_peers: Vec<PeerId>,
    },
}

impl From<TrackerEvent> for ProviderEvent {
    fn from(event: TrackerEvent) -> Self {
        match event {
            TrackerEvent::PeersChanged {
                added,
                removed,
                mesh_peers,
                local_peers,
            } => ProviderEvent::Peers {
                added,
                removed,
                mesh_peers,
                local_peers,
            },
            TrackerEvent::SyncedChanged { synced } => ProviderEvent::Synced { synced },
        }
    }
}

/// Everything needed to open a [`Room`].
pub struct RoomSetup {
    /// Full room name, also the broadcast channel name.
    pub name: String,
    /// Shared document.
    pub doc: Arc<dyn Document>,
    /// Awareness of the document.
    pub awareness: Arc<Awareness>,
    /// Broadcast-channel key. `None` sends plaintext.
    pub key: Option<RoomKey>,
    /// Mesh backend.
    pub mesh: Arc<dyn MeshConnector>,
    /// Same-device broadcast hub.
    pub broadcast: Arc<dyn BroadcastChannel>,
    /// Options passed on every mesh join.
    pub mesh_options: MeshOptions,
    /// Announce presence on the broadcast channel.
    pub filter_bc_conns: bool,
    /// Awareness outdated timeout.
    pub awareness_timeout: Duration,
    /// Where [`ProviderEvent`]s go.
    pub events: broadcast::Sender<ProviderEvent>,
    /// Host shutdown signal. The room disconnects when it flips to `true`.
    pub shutdown: Option<watch::Receiver<bool>>,
}

/// Spawned tasks aborted together when dropped.
#[derive(Default)]
struct Subscriptions {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscriptions {
    fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    lifecycle: RoomState,
    tracker: PeerTracker,
    mesh: Option<Arc<dyn MeshTransport>>,
    mesh_pump: Option<JoinHandle<()>>,
    broadcast: Option<Arc<dyn BroadcastSender>>,
    broadcast_pump: Option<JoinHandle<()>>,
    local: Option<Subscriptions>,
    shutdown_hook: Option<JoinHandle<()>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let tasks = [
            self.mesh_pump.take(),
            self.broadcast_pump.take(),
            self.shutdown_hook.take(),
        ];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}

/// Fallible resources acquired before a transition is committed.
#[derive(Default)]
struct Prepared {
    mesh: Option<MeshHandle>,
    updates: Option<UpdateSubscription>,
    broadcast: Option<BroadcastSubscription>,
}

struct RoomInner {
    name: String,
    presence_id: PeerId,
    doc: Arc<dyn Document>,
    awareness: Arc<Awareness>,
    key: Option<RoomKey>,
    mesh_connector: Arc<dyn MeshConnector>,
    broadcast_channel: Arc<dyn BroadcastChannel>,
    mesh_options: MeshOptions,
    filter_bc_conns: bool,
    awareness_timeout: Duration,
    events: broadcast::Sender<ProviderEvent>,
    ops: Mutex<()>,
    bc: Mutex<()>,
    state: Mutex<Shared>,
}

/// A live room session. Clones share the session.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl Room {
    /// Join the mesh and build the session in the `Created` state.
    ///
    /// Mesh peers are synced with from this point on; the broadcast channel
    /// and local change forwarding start with [`connect`](Self::connect).
    pub async fn open(setup: RoomSetup) -> Result<Self, ProviderError> {
        let handle = setup.mesh.join(&setup.name, &setup.mesh_options).await?;
        let presence_id = PeerId::random();

        let inner = Arc::new(RoomInner {
            name: setup.name,
            presence_id: presence_id.clone(),
            doc: setup.doc,
            awareness: setup.awareness,
            key: setup.key,
            mesh_connector: setup.mesh,
            broadcast_channel: setup.broadcast,
            mesh_options: setup.mesh_options,
            filter_bc_conns: setup.filter_bc_conns,
            awareness_timeout: setup.awareness_timeout,
            events: setup.events,
            ops: Mutex::new(()),
            bc: Mutex::new(()),
            state: Mutex::new(Shared {
                lifecycle: RoomState::new(),
                tracker: PeerTracker::new(presence_id),
                mesh: None,
                mesh_pump: None,
                broadcast: None,
                broadcast_pump: None,
                local: None,
                shutdown_hook: None,
            }),
        });

        inner.attach_mesh(handle).await;
        if let Some(shutdown) = setup.shutdown {
            let hook = spawn_shutdown_watcher(Arc::downgrade(&inner), shutdown);
            inner.state.lock().await.shutdown_hook = Some(hook);
        }

        info!(room = %inner.name, presence = %inner.presence_id, "room opened");
        Ok(Self { inner })
    }

    /// Full room name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Id announced to same-device peers.
    pub fn presence_id(&self) -> &PeerId {
        &self.inner.presence_id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RoomState {
        self.inner.state.lock().await.lifecycle
    }

    /// True between connect and disconnect.
    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    /// Last reported room-wide synced state.
    pub async fn is_synced(&self) -> bool {
        self.inner.state.lock().await.tracker.is_synced()
    }

    /// Connected mesh peers.
    pub async fn mesh_peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().await.tracker.mesh_peers()
    }

    /// Known same-device peers.
    pub async fn local_peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().await.tracker.local_peers()
    }

    /// The document's awareness.
    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.inner.awareness
    }

    /// Receive future [`ProviderEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    /// Connect: subscribe local changes and the broadcast channel, announce
    /// presence, and run the initial same-device sync. No-op when already
    /// connected.
    ///
    /// # Errors
    ///
    /// Fails when the room was destroyed, or when a subscription or the mesh
    /// re-join fails. The room state is unchanged on failure.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        self.inner.transition(RoomEvent::ConnectRequested).await
    }

    /// Disconnect: withdraw the local awareness and presence, drop every
    /// subscription and leave the mesh. No-op when not connected.
    pub async fn disconnect(&self) {
        if let Err(e) = self.inner.transition(RoomEvent::DisconnectRequested).await {
            warn!(room = %self.inner.name, error = %e, "disconnect failed");
        }
    }

    /// Disconnect and stop watching the shutdown signal. Terminal.
    pub async fn destroy(&self) {
        if let Err(e) = self.inner.transition(RoomEvent::DestroyRequested).await {
            warn!(room = %self.inner.name, error = %e, "destroy failed");
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.inner.name)
            .field("presence_id", &self.inner.presence_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RoomHandle for Room {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn disconnect(&self) {
        Room::disconnect(self).await;
    }
}

impl RoomInner {
    async fn transition(self: &Arc<Self>, event: RoomEvent) -> Result<(), ProviderError> {
        let _ops = self.ops.lock().await;

        let current = self.state.lock().await.lifecycle;
        if current.is_destroyed() && event == RoomEvent::ConnectRequested {
            return Err(ProviderError::Destroyed);
        }
        let (next, actions) = current.on_event(event);
        if actions.is_empty() {
            trace!(room = %self.name, ?event, state = ?current, "ignored lifecycle request");
            return Ok(());
        }

        let mut prepared = self.prepare(&actions).await?;
        self.state.lock().await.lifecycle = next;
        debug!(room = %self.name, from = ?current, to = ?next, "room transition");

        for action in actions {
            self.perform(action, &mut prepared).await;
        }
        Ok(())
    }

    async fn prepare(&self, actions: &[RoomAction]) -> Result<Prepared, ProviderError> {
        let mut prepared = Prepared::default();
        if actions.contains(&RoomAction::SubscribeLocalChanges) {
            prepared.updates = Some(self.doc.subscribe_updates()?);
        }
        if actions.contains(&RoomAction::SubscribeBroadcast) {
            prepared.broadcast = Some(self.broadcast_channel.subscribe(&self.name).await?);
        }
        if actions.contains(&RoomAction::JoinMesh) {
            prepared.mesh = Some(
                self.mesh_connector
                    .join(&self.name, &self.mesh_options)
                    .await?,
            );
        }
        Ok(prepared)
    }

    async fn perform(self: &Arc<Self>, action: RoomAction, prepared: &mut Prepared) {
        trace!(room = %self.name, ?action, "performing action");
        match action {
            RoomAction::JoinMesh => {
                if let Some(handle) = prepared.mesh.take() {
                    self.attach_mesh(handle).await;
                }
            }
            RoomAction::SubscribeLocalChanges => {
                if let Some(updates) = prepared.updates.take() {
                    let subscriptions = self.spawn_local_pumps(updates);
                    self.state.lock().await.local = Some(subscriptions);
                }
            }
            RoomAction::SubscribeBroadcast => {
                if let Some(subscription) = prepared.broadcast.take() {
                    let pump = spawn_broadcast_pump(Arc::downgrade(self), subscription.messages);
                    let mut state = self.state.lock().await;
                    state.broadcast = Some(subscription.sender);
                    state.broadcast_pump = Some(pump);
                }
            }
            RoomAction::AnnouncePresence => {
                self.send_frame(&self.presence(true), Delivery::Broadcast)
                    .await;
            }
            RoomAction::SendInitialSync => self.send_initial_sync().await,
            RoomAction::RemoveLocalAwareness => {
                let client = self.awareness.client_id();
                self.awareness
                    .remove_states(&[client], AwarenessOrigin::Local);
                let tombstone = Frame::Awareness(self.awareness.encode_update(&[client]));
                self.send_frame(&tombstone, Delivery::Room).await;
            }
            RoomAction::WithdrawPresence => {
                self.send_frame(&self.presence(false), Delivery::Broadcast)
                    .await;
            }
            RoomAction::UnsubscribeBroadcast => {
                let mut state = self.state.lock().await;
                state.broadcast = None;
                if let Some(pump) = state.broadcast_pump.take() {
                    pump.abort();
                }
            }
            RoomAction::UnsubscribeLocalChanges => {
                self.state.lock().await.local = None;
            }
            RoomAction::LeaveMesh => self.leave_mesh().await,
            RoomAction::ReleaseShutdownHook => {
                if let Some(hook) = self.state.lock().await.shutdown_hook.take() {
                    hook.abort();
                }
            }
            RoomAction::EmitStatus { connected } => {
                info!(room = %self.name, connected, "room status");
                self.emit(ProviderEvent::Status { connected });
            }
        }
    }

    fn presence(&self, add: bool) -> Frame {
        Frame::PresenceAnnounce {
            add,
            peer_id: self.presence_id.as_str().to_string(),
        }
    }

    async fn send_initial_sync(&self) {
        let step1 = Frame::Sync(SyncMessage::Step1(self.doc.encode_state_vector()));
        self.send_frame(&step1, Delivery::Broadcast).await;

        match self.doc.encode_state_as_update(&[]) {
            Ok(update) => {
                let step2 = Frame::Sync(SyncMessage::Step2(update));
                self.send_frame(&step2, Delivery::Broadcast).await;
            }
            Err(e) => warn!(room = %self.name, error = %e, "cannot encode full state"),
        }

        self.send_frame(&Frame::QueryAwareness, Delivery::Broadcast)
            .await;

        if self.awareness.local_state().is_some() {
            let client = self.awareness.client_id();
            let snapshot = Frame::Awareness(self.awareness.encode_update(&[client]));
            self.send_frame(&snapshot, Delivery::Broadcast).await;
        }
    }

    async fn attach_mesh(self: &Arc<Self>, handle: MeshHandle) {
        let MeshHandle { transport, events } = handle;
        debug!(room = %self.name, local = %transport.local_id(), "mesh attached");
        let mut state = self.state.lock().await;
        state.mesh = Some(transport);
        state.mesh_pump = Some(spawn_mesh_pump(Arc::downgrade(self), events));
    }

    async fn leave_mesh(&self) {
        let (transport, pump, events) = {
            let mut state = self.state.lock().await;
            let events = state.tracker.reset();
            (state.mesh.take(), state.mesh_pump.take(), events)
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.leave().await {
                warn!(room = %self.name, error = %e, "failed to leave mesh");
            }
        }
        self.emit_all(events);
    }

    fn spawn_local_pumps(self: &Arc<Self>, updates: UpdateSubscription) -> Subscriptions {
        let mut subscriptions = Subscriptions::default();

        let weak = Arc::downgrade(self);
        subscriptions.push(tokio::spawn(async move {
            let mut updates = updates;
            while let Some(update) = updates.updates.recv().await {
                let Some(room) = weak.upgrade() else { break };
                let frame = Frame::Sync(SyncMessage::Update(update));
                room.send_frame(&frame, Delivery::Room).await;
            }
        }));

        let weak = Arc::downgrade(self);
        let mut changes = self.awareness.subscribe();
        subscriptions.push(tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                if change.origin == AwarenessOrigin::Remote {
                    continue;
                }
                let Some(room) = weak.upgrade() else { break };
                let clients = change.changed_clients();
                let frame = Frame::Awareness(room.awareness.encode_update(&clients));
                room.send_frame(&frame, Delivery::Room).await;
            }
        }));

        let weak = Arc::downgrade(self);
        let timeout = self.awareness_timeout;
        subscriptions.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval((timeout / 10).max(Duration::from_millis(10)));
            loop {
                ticker.tick().await;
                let Some(room) = weak.upgrade() else { break };
                room.awareness.remove_outdated(timeout);
            }
        }));

        subscriptions
    }

    fn links(&self, state: &Shared) -> Links {
        Links {
            broadcast: state.broadcast.is_some(),
            mesh: state.mesh.is_some(),
            announce_presence: self.filter_bc_conns,
        }
    }

    async fn send_frame(&self, frame: &Frame, delivery: Delivery) {
        self.fan_out(frame, delivery, false).await;
    }

    /// Route and send `frame`. `holding_bc` is true when the caller already
    /// holds the broadcast lock.
    async fn fan_out(&self, frame: &Frame, delivery: Delivery, holding_bc: bool) {
        let (route, mesh, sender) = {
            let state = self.state.lock().await;
            let route = route(frame.message_type(), &delivery, self.links(&state));
            (route, state.mesh.clone(), state.broadcast.clone())
        };
        if route.is_empty() {
            trace!(room = %self.name, tag = %frame.message_type(), "frame not routed");
            return;
        }
        let bytes = frame.encode();

        if route.broadcast {
            if let Some(sender) = sender {
                let _bc = if holding_bc {
                    None
                } else {
                    Some(self.bc.lock().await)
                };
                self.publish(sender.as_ref(), &bytes).await;
            }
        }

        if let (Some(target), Some(mesh)) = (route.mesh, mesh) {
            let peer = match &target {
                MeshTarget::All => None,
                MeshTarget::Peer(id) => Some(id),
            };
            if let Err(e) = mesh.send(&bytes, peer).await {
                warn!(room = %self.name, peer = ?peer, error = %e, "mesh send failed");
            }
        }
    }

    async fn publish(&self, sender: &dyn BroadcastSender, bytes: &[u8]) {
        let payload = match &self.key {
            Some(key) => match key.seal(bytes) {
                Ok(sealed) => sealed,
                Err(e) => {
                    error!(room = %self.name, error = %e, "failed to encrypt broadcast frame");
                    return;
                }
            },
            None => bytes.to_vec(),
        };
        if let Err(e) = sender.publish(&payload).await {
            warn!(room = %self.name, error = %e, "broadcast publish failed");
        }
    }

    async fn handle_broadcast(&self, payload: Vec<u8>) {
        let _bc = self.bc.lock().await;

        let bytes = match &self.key {
            Some(key) => match key.open(&payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(room = %self.name, error = %e, "dropping undecryptable broadcast frame");
                    return;
                }
            },
            None => payload,
        };

        let outcome = match dispatch(&self.name, &bytes, self.doc.as_ref(), &self.awareness) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(room = %self.name, error = %e, "dropping broadcast frame");
                return;
            }
        };

        if let Some((add, id)) = outcome.presence {
            let presence = self.state.lock().await.tracker.on_presence(add, id);
            self.emit_all(presence.events);
            if presence.reannounce {
                self.fan_out(&self.presence(true), Delivery::Broadcast, true)
                    .await;
            }
        }
        if let Some(reply) = outcome.reply {
            self.fan_out(&reply, Delivery::Broadcast, true).await;
        }
    }

    async fn handle_mesh_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::PeerJoined(peer) => {
                debug!(room = %self.name, peer = %peer, "mesh peer joined");
                let events = self.state.lock().await.tracker.on_peer_join(peer.clone());
                self.emit_all(events);

                let step1 = Frame::Sync(SyncMessage::Step1(self.doc.encode_state_vector()));
                self.send_frame(&step1, Delivery::Peer(peer.clone())).await;

                if !self.awareness.states().is_empty() {
                    let snapshot = Frame::Awareness(self.awareness.encode_all());
                    self.send_frame(&snapshot, Delivery::Peer(peer)).await;
                }
            }
            MeshEvent::PeerLeft(peer) => {
                debug!(room = %self.name, peer = %peer, "mesh peer left");
                let events = self.state.lock().await.tracker.on_peer_leave(&peer);
                self.emit_all(events);
            }
            MeshEvent::Message { from, bytes } => {
                let outcome = match dispatch(&self.name, &bytes, self.doc.as_ref(), &self.awareness)
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(room = %self.name, peer = %from, error = %e, "dropping mesh frame");
                        return;
                    }
                };
                if let Some(reply) = outcome.reply {
                    self.send_frame(&reply, Delivery::Peer(from.clone())).await;
                }
                if outcome.step2_received {
                    let events = self.state.lock().await.tracker.on_peer_synced(&from);
                    self.emit_all(events);
                }
                if outcome.presence.is_some() {
                    debug!(room = %self.name, peer = %from, "ignoring presence frame from mesh");
                }
            }
        }
    }

    fn emit(&self, event: ProviderEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<TrackerEvent>) {
        for event in events {
            if let TrackerEvent::SyncedChanged { synced } = &event {
                info!(room = %self.name, synced, "synced state changed");
            }
            self.emit(event.into());
        }
    }
}

fn spawn_mesh_pump(
    room: Weak<RoomInner>,
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(room) = room.upgrade() else { break };
            room.handle_mesh_event(event).await;
        }
    })
}

fn spawn_broadcast_pump(
    room: Weak<RoomInner>,
    mut messages: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = messages.recv().await {
            let Some(room) = room.upgrade() else { break };
            room.handle_broadcast(payload).await;
        }
    })
}

fn spawn_shutdown_watcher(
    room: Weak<RoomInner>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
        if let Some(room) = room.upgrade() {
            info!(room = %room.name, "shutdown signal received");
            Room { inner: room }.disconnect().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::YrsDocument;
    use crate::transport::{MemoryBroadcast, MemoryMesh};
    use duplex_sync_types::MessageType;
    use tokio::time::{sleep, timeout};

    struct Fixture {
        room: Room,
        doc: Arc<YrsDocument>,
        mesh: MemoryMesh,
        hub: MemoryBroadcast,
        events: broadcast::Receiver<ProviderEvent>,
    }

    fn setup(
        name: &str,
        doc: Arc<YrsDocument>,
        mesh: &MemoryMesh,
        hub: &MemoryBroadcast,
        key: Option<RoomKey>,
    ) -> (RoomSetup, broadcast::Receiver<ProviderEvent>) {
        let (events, rx) = broadcast::channel(64);
        let awareness = Arc::new(Awareness::new(doc.client_id()));
        let setup = RoomSetup {
            name: name.to_string(),
            doc,
            awareness,
            key,
            mesh: Arc::new(mesh.clone()),
            broadcast: Arc::new(hub.clone()),
            mesh_options: MeshOptions::default(),
            filter_bc_conns: true,
            awareness_timeout: Duration::from_secs(30),
            events,
            shutdown: None,
        };
        (setup, rx)
    }

    async fn open(name: &str, mesh: &MemoryMesh, hub: &MemoryBroadcast) -> Fixture {
        let doc = Arc::new(YrsDocument::new());
        let (setup, events) = setup(name, doc.clone(), mesh, hub, None);
        let room = Room::open(setup).await.unwrap();
        Fixture {
            room,
            doc,
            mesh: mesh.clone(),
            hub: hub.clone(),
            events,
        }
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(5), async {
            while !condition().await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    async fn wait_for_subscribers(hub: &MemoryBroadcast, expected: usize) {
        let hub = hub.clone();
        wait_until(move || {
            let count = hub.subscriber_count("app-room");
            async move { count == expected }
        })
        .await;
    }

    fn published_types(hub: &MemoryBroadcast) -> Vec<MessageType> {
        hub.published()
            .into_iter()
            .filter_map(|(_, bytes)| Frame::decode(&bytes).ok())
            .map(|frame| frame.message_type())
            .collect()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn open_joins_mesh_without_connecting() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        assert_eq!(f.room.state().await, RoomState::Created);
        assert_eq!(f.mesh.peers("app-room").len(), 1);
        assert_eq!(f.hub.subscriber_count("app-room"), 0);
    }

    #[tokio::test]
    async fn connect_runs_initial_broadcast_sync() {
        let mut f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.room.connect().await.unwrap();

        assert!(f.room.is_connected().await);
        assert_eq!(f.hub.subscriber_count("app-room"), 1);
        assert_eq!(
            published_types(&f.hub),
            vec![
                MessageType::PresenceAnnounce,
                MessageType::Sync,
                MessageType::Sync,
                MessageType::QueryAwareness,
                MessageType::Awareness,
            ]
        );
        assert_eq!(
            f.events.recv().await.unwrap(),
            ProviderEvent::Status { connected: true }
        );
    }

    #[tokio::test]
    async fn connect_twice_is_noop() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.room.connect().await.unwrap();
        let published = f.hub.published().len();

        f.room.connect().await.unwrap();
        assert_eq!(f.hub.published().len(), published);
    }

    #[tokio::test]
    async fn disconnect_withdraws_and_leaves() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.room.connect().await.unwrap();
        f.room.disconnect().await;

        assert_eq!(f.room.state().await, RoomState::Disconnected);
        assert!(f.mesh.peers("app-room").is_empty());
        assert!(f.room.awareness().local_state().is_none());
        wait_for_subscribers(&f.hub, 0).await;

        let after_connect: Vec<Frame> = f.hub.published()[5..]
            .iter()
            .filter_map(|(_, bytes)| Frame::decode(bytes).ok())
            .collect();
        assert!(after_connect
            .iter()
            .any(|frame| matches!(frame, Frame::Awareness(_))));
        assert!(after_connect.iter().any(|frame| matches!(
            frame,
            Frame::PresenceAnnounce { add: false, .. }
        )));
    }

    #[tokio::test]
    async fn disconnect_when_not_connected_only_leaves_mesh() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.room.disconnect().await;
        assert!(f.mesh.peers("app-room").is_empty());
        assert!(f.hub.published().is_empty());
    }

    #[tokio::test]
    async fn reconnect_rejoins_mesh() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.room.connect().await.unwrap();
        f.room.disconnect().await;
        f.room.connect().await.unwrap();

        assert!(f.room.is_connected().await);
        assert_eq!(f.mesh.peers("app-room").len(), 1);
        assert_eq!(f.mesh.joins().len(), 2);
    }

    #[tokio::test]
    async fn failed_rejoin_keeps_room_disconnected() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.room.connect().await.unwrap();
        f.room.disconnect().await;

        f.mesh.fail_next_join("signalling down");
        assert!(matches!(
            f.room.connect().await,
            Err(ProviderError::Transport(_))
        ));
        assert_eq!(f.room.state().await, RoomState::Disconnected);
        wait_for_subscribers(&f.hub, 0).await;
    }

    #[tokio::test]
    async fn destroyed_room_refuses_connect() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.room.destroy().await;
        assert!(matches!(
            f.room.connect().await,
            Err(ProviderError::Destroyed)
        ));
        // Destroy again is a no-op.
        f.room.destroy().await;
        assert_eq!(f.room.state().await, RoomState::Destroyed);
    }

    #[tokio::test]
    async fn shutdown_signal_disconnects() {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let doc = Arc::new(YrsDocument::new());
        let (mut setup, _events) = setup("app-room", doc, &mesh, &hub, None);
        let (tx, rx) = watch::channel(false);
        setup.shutdown = Some(rx);

        let room = Room::open(setup).await.unwrap();
        room.connect().await.unwrap();
        tx.send_replace(true);

        let r = room.clone();
        wait_until(move || {
            let r = r.clone();
            async move { r.state().await == RoomState::Disconnected }
        })
        .await;
    }

    // =========================================================================
    // Mesh
    // =========================================================================

    #[tokio::test]
    async fn mesh_peers_sync_and_report() {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let a = open("app-room", &mesh, &hub).await;
        a.doc.push_text("from a");
        a.room.connect().await.unwrap();

        let b = open("app-room", &mesh, &hub).await;
        b.doc.push_text(" and b");
        b.room.connect().await.unwrap();

        let (ra, rb) = (a.room.clone(), b.room.clone());
        wait_until(move || {
            let (ra, rb) = (ra.clone(), rb.clone());
            async move { ra.is_synced().await && rb.is_synced().await }
        })
        .await;

        let (da, db) = (a.doc.clone(), b.doc.clone());
        wait_until(move || {
            let equal = da.text() == db.text();
            async move { equal }
        })
        .await;
        assert!(a.doc.text().contains("from a"));
        assert_eq!(a.room.mesh_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn departed_peer_is_forgotten() {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let a = open("app-room", &mesh, &hub).await;
        let b = open("app-room", &mesh, &hub).await;

        let ra = a.room.clone();
        wait_until(move || {
            let ra = ra.clone();
            async move { ra.is_synced().await }
        })
        .await;

        b.room.disconnect().await;
        let ra = a.room.clone();
        wait_until(move || {
            let ra = ra.clone();
            async move { ra.mesh_peers().await.is_empty() }
        })
        .await;
        // Vacuously synced with no peers left.
        assert!(a.room.is_synced().await);
    }

    #[tokio::test]
    async fn disconnect_keeps_synced_in_line_with_aggregate() {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let a = open("app-room", &mesh, &hub).await;
        let _b = open("app-room", &mesh, &hub).await;

        let ra = a.room.clone();
        wait_until(move || {
            let ra = ra.clone();
            async move { ra.is_synced().await && ra.mesh_peers().await.len() == 1 }
        })
        .await;

        a.room.disconnect().await;
        let aggregate = a.room.inner.state.lock().await.tracker.aggregate_synced();
        assert!(aggregate);
        assert_eq!(a.room.is_synced().await, aggregate);

        // Still in line after reconnecting.
        a.room.connect().await.unwrap();
        let ra = a.room.clone();
        wait_until(move || {
            let ra = ra.clone();
            async move { ra.is_synced().await && ra.mesh_peers().await.len() == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn malformed_mesh_frame_is_dropped() {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let a = open("app-room", &mesh, &hub).await;

        let MeshHandle { transport, .. } = mesh
            .join("app-room", &MeshOptions::default())
            .await
            .unwrap();
        transport.send(&[42, 1, 2], None).await.unwrap();
        a.doc.push_text("still alive");

        sleep(Duration::from_millis(50)).await;
        assert_eq!(a.doc.text(), "still alive");
    }

    // =========================================================================
    // Broadcast channel
    // =========================================================================

    #[tokio::test]
    async fn same_device_rooms_track_each_other() {
        let hub = MemoryBroadcast::new();
        let a = open("app-room", &MemoryMesh::new(), &hub).await;
        let b = open("app-room", &MemoryMesh::new(), &hub).await;
        a.room.connect().await.unwrap();
        b.room.connect().await.unwrap();

        let (ra, rb) = (a.room.clone(), b.room.clone());
        wait_until(move || {
            let (ra, rb) = (ra.clone(), rb.clone());
            async move {
                ra.local_peers().await == vec![rb.presence_id().clone()]
                    && rb.local_peers().await == vec![ra.presence_id().clone()]
            }
        })
        .await;

        b.room.disconnect().await;
        let ra = a.room.clone();
        wait_until(move || {
            let ra = ra.clone();
            async move { ra.local_peers().await.is_empty() }
        })
        .await;
    }

    #[tokio::test]
    async fn local_edits_reach_same_device_room() {
        let hub = MemoryBroadcast::new();
        let a = open("app-room", &MemoryMesh::new(), &hub).await;
        let b = open("app-room", &MemoryMesh::new(), &hub).await;
        a.room.connect().await.unwrap();
        b.room.connect().await.unwrap();

        a.doc.push_text("typed in a");
        let db = b.doc.clone();
        wait_until(move || {
            let done = db.text() == "typed in a";
            async move { done }
        })
        .await;
    }

    #[tokio::test]
    async fn presence_is_not_sent_when_disabled() {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let doc = Arc::new(YrsDocument::new());
        let (mut setup, _events) = setup("app-room", doc, &mesh, &hub, None);
        setup.filter_bc_conns = false;

        let room = Room::open(setup).await.unwrap();
        room.connect().await.unwrap();
        assert!(!published_types(&hub).contains(&MessageType::PresenceAnnounce));
    }

    #[tokio::test]
    async fn keyed_room_publishes_ciphertext() {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let doc = Arc::new(YrsDocument::new());
        let key = RoomKey::from_bytes([7u8; 32]);
        let (setup, _events) = setup("app-room", doc, &mesh, &hub, Some(key.clone()));

        let room = Room::open(setup).await.unwrap();
        room.connect().await.unwrap();

        let published = hub.published();
        assert!(!published.is_empty());
        for (_, payload) in published {
            let plain = key.open(&payload).unwrap();
            assert!(Frame::decode(&plain).is_ok());
        }
    }

    #[tokio::test]
    async fn broadcast_publish_failure_does_not_fail_connect() {
        let f = open("app-room", &MemoryMesh::new(), &MemoryBroadcast::new()).await;
        f.hub.fail_next_publish("quota");
        f.room.connect().await.unwrap();
        assert!(f.room.is_connected().await);
    }
}
