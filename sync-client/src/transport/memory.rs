//! In-memory transports.
//!
//! [`MemoryMesh`] is a process-local mesh network and [`MemoryBroadcast`] a
//! process-local broadcast hub. Clones share state, so one value can be
//! handed to several sessions to connect them. Both record what was sent and
//! can be told to fail the next operation, for tests.

use super::{
    BroadcastChannel, BroadcastSender, BroadcastSubscription, MeshConnector, MeshEvent,
    MeshHandle, MeshOptions, MeshTransport, TransportError,
};
use async_trait::async_trait;
use duplex_sync_types::PeerId;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A frame recorded by [`MemoryMesh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    /// Mesh room.
    pub room: String,
    /// Sender.
    pub from: PeerId,
    /// Addressee, `None` for a send to all peers.
    pub to: Option<PeerId>,
    /// Payload.
    pub bytes: Vec<u8>,
}

/// Process-local mesh network.
#[derive(Debug, Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<Mutex<MeshInner>>,
}

#[derive(Debug, Default)]
struct MeshInner {
    rooms: HashMap<String, BTreeMap<PeerId, mpsc::UnboundedSender<MeshEvent>>>,
    next_peer: u64,
    sent: Vec<SentFrame>,
    joins: Vec<(String, MeshOptions)>,
    fail_next_join: Option<String>,
    fail_next_send: Option<String>,
}

impl MemoryMesh {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers currently joined to `room`.
    pub fn peers(&self, room: &str) -> Vec<PeerId> {
        let inner = lock(&self.inner);
        inner
            .rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every frame sent so far.
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        lock(&self.inner).sent.clone()
    }

    /// Rooms joined so far, with the options they were joined with.
    pub fn joins(&self) -> Vec<(String, MeshOptions)> {
        lock(&self.inner).joins.clone()
    }

    /// Cause the next join() to fail with the given error.
    pub fn fail_next_join(&self, error: &str) {
        lock(&self.inner).fail_next_join = Some(error.to_string());
    }

    /// Cause the next send() on any handle to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        lock(&self.inner).fail_next_send = Some(error.to_string());
    }
}

#[async_trait]
impl MeshConnector for MemoryMesh {
    async fn join(&self, room: &str, options: &MeshOptions) -> Result<MeshHandle, TransportError> {
        let mut inner = lock(&self.inner);

        if let Some(error) = inner.fail_next_join.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.next_peer += 1;
        let id = PeerId::new(format!("mesh-peer-{}", inner.next_peer));
        let (tx, rx) = mpsc::unbounded_channel();

        let members = inner.rooms.entry(room.to_string()).or_default();
        for (other_id, other_tx) in members.iter() {
            // Both ends observe the new connection.
            let _ = other_tx.send(MeshEvent::PeerJoined(id.clone()));
            let _ = tx.send(MeshEvent::PeerJoined(other_id.clone()));
        }
        members.insert(id.clone(), tx);
        inner.joins.push((room.to_string(), options.clone()));

        Ok(MeshHandle {
            transport: Arc::new(MemoryMeshPeer {
                network: self.clone(),
                room: room.to_string(),
                id,
                left: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

/// One peer's handle on a [`MemoryMesh`] room.
#[derive(Debug)]
struct MemoryMeshPeer {
    network: MemoryMesh,
    room: String,
    id: PeerId,
    left: AtomicBool,
}

#[async_trait]
impl MeshTransport for MemoryMeshPeer {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    async fn send(&self, bytes: &[u8], peer: Option<&PeerId>) -> Result<(), TransportError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut inner = lock(&self.network.inner);

        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        let members = inner
            .rooms
            .get(&self.room)
            .ok_or(TransportError::NotConnected)?;
        let message = MeshEvent::Message {
            from: self.id.clone(),
            bytes: bytes.to_vec(),
        };
        match peer {
            Some(target) => {
                let tx = members
                    .get(target)
                    .ok_or_else(|| TransportError::UnknownPeer(target.clone()))?;
                let _ = tx.send(message);
            }
            None => {
                for (id, tx) in members.iter() {
                    if *id != self.id {
                        let _ = tx.send(message.clone());
                    }
                }
            }
        }

        inner.sent.push(SentFrame {
            room: self.room.clone(),
            from: self.id.clone(),
            to: peer.cloned(),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = lock(&self.network.inner);
        let mut now_empty = false;
        if let Some(members) = inner.rooms.get_mut(&self.room) {
            // Dropping our sender ends our own event stream.
            members.remove(&self.id);
            for tx in members.values() {
                let _ = tx.send(MeshEvent::PeerLeft(self.id.clone()));
            }
            now_empty = members.is_empty();
        }
        if now_empty {
            inner.rooms.remove(&self.room);
        }
        Ok(())
    }
}

/// Process-local broadcast hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroadcast {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Debug, Default)]
struct HubInner {
    channels: HashMap<String, Vec<Subscriber>>,
    next_subscriber: u64,
    published: Vec<(String, Vec<u8>)>,
    fail_next_publish: Option<String>,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemoryBroadcast {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers of `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        let inner = lock(&self.inner);
        inner
            .channels
            .get(name)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Every payload published so far, with its channel name.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.inner).published.clone()
    }

    /// Cause the next publish() to fail with the given error.
    pub fn fail_next_publish(&self, error: &str) {
        lock(&self.inner).fail_next_publish = Some(error.to_string());
    }
}

#[async_trait]
impl BroadcastChannel for MemoryBroadcast {
    async fn subscribe(&self, name: &str) -> Result<BroadcastSubscription, TransportError> {
        let mut inner = lock(&self.inner);
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .channels
            .entry(name.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        Ok(BroadcastSubscription {
            sender: Arc::new(MemoryBroadcastSender {
                hub: self.clone(),
                channel: name.to_string(),
                id,
            }),
            messages: rx,
        })
    }
}

#[derive(Debug)]
struct MemoryBroadcastSender {
    hub: MemoryBroadcast,
    channel: String,
    id: u64,
}

#[async_trait]
impl BroadcastSender for MemoryBroadcastSender {
    async fn publish(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = lock(&self.hub.inner);

        if let Some(error) = inner.fail_next_publish.take() {
            return Err(TransportError::SendFailed(error));
        }

        if let Some(subs) = inner.channels.get_mut(&self.channel) {
            subs.retain(|s| !s.tx.is_closed());
            for sub in subs.iter().filter(|s| s.id != self.id) {
                let _ = sub.tx.send(bytes.to_vec());
            }
        }
        inner.published.push((self.channel.clone(), bytes.to_vec()));
        Ok(())
    }
}
