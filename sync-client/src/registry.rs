//! Room registry.
//!
//! At most one session may be bound to a room name at a time. The registry
//! is an explicit value owned by the host; clones share the same map.
//!
//! A name is first *reserved* and later *activated* with the session's
//! handle. The reservation is released automatically if construction fails
//! before activation.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another session already uses this room name.
    #[error("a document is already connected to room {0:?}")]
    DuplicateRoom(String),
}

/// What the registry needs from a live session.
#[async_trait]
pub trait RoomHandle: Send + Sync {
    /// Full room name.
    fn name(&self) -> &str;

    /// Disconnect the session (it stays registered).
    async fn disconnect(&self);
}

#[derive(Clone)]
enum Slot {
    Reserved,
    Active(Arc<dyn RoomHandle>),
}

/// Map of room name to live session.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Slot>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateRoom`] if the name is reserved or active.
    pub fn reserve(&self, name: &str) -> Result<Reservation, RegistryError> {
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateRoom(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Reserved);
                debug!(room = name, "room name reserved");
                Ok(Reservation {
                    registry: self.clone(),
                    name: name.to_string(),
                    active: false,
                })
            }
        }
    }

    /// Release `name`. Returns true if it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.rooms.remove(name).is_some();
        if removed {
            debug!(room = name, "room unregistered");
        }
        removed
    }

    /// True if `name` is reserved or active.
    pub fn contains(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    /// Number of reserved or active names.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// True if no name is registered.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Disconnect every active session. Used on process shutdown.
    pub async fn disconnect_all(&self) {
        // Collect first; no map guard may be held across an await.
        let handles: Vec<Arc<dyn RoomHandle>> = self
            .rooms
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Active(handle) => Some(Arc::clone(handle)),
                Slot::Reserved => None,
            })
            .collect();

        info!(rooms = handles.len(), "disconnecting all rooms");
        for handle in handles {
            handle.disconnect().await;
        }
    }
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("rooms", &self.names())
            .finish()
    }
}

/// A claimed room name, released on drop unless activated.
#[derive(Debug)]
pub struct Reservation {
    registry: RoomRegistry,
    name: String,
    active: bool,
}

impl Reservation {
    /// The reserved name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the name to a live session.
    pub fn activate(mut self, handle: Arc<dyn RoomHandle>) {
        self.registry
            .rooms
            .insert(self.name.clone(), Slot::Active(handle));
        self.active = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.active {
            self.registry.rooms.remove(&self.name);
        }
    }
}
