//! Provider: the application-facing entry point.
//!
//! A [`Provider`] binds one document to one room. Building it validates the
//! configuration, claims the room name in the [`RoomRegistry`], derives the
//! broadcast-channel key, joins the mesh and (unless told otherwise)
//! connects.
//!
//! # Example
//!
//! ```ignore
//! use duplex_sync_client::{
//!     MemoryBroadcast, MemoryMesh, Provider, ProviderConfig, ProviderContext, YrsDocument,
//! };
//!
//! let ctx = ProviderContext::new(Arc::new(MemoryMesh::new()), Arc::new(MemoryBroadcast::new()));
//! let doc = Arc::new(YrsDocument::new());
//! let provider = Provider::new(ProviderConfig::new("notes").with_password("pw"), doc, ctx).await?;
//!
//! let mut events = provider.subscribe();
//! while let Ok(event) = events.recv().await { /* ... */ }
//! ```

use crate::awareness::Awareness;
use crate::config::ProviderConfig;
use crate::crypto::{CryptoError, RoomKey};
use crate::document::Document;
use crate::error::ProviderError;
use crate::registry::RoomRegistry;
use crate::room::{ProviderEvent, Room, RoomSetup};
use crate::transport::{BroadcastChannel, MeshConnector, MeshOptions};
use duplex_sync_types::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use zeroize::Zeroizing;

const EVENT_CAPACITY: usize = 64;

/// Host-provided collaborators shared by providers.
#[derive(Clone)]
pub struct ProviderContext {
    /// Mesh backend.
    pub mesh: Arc<dyn MeshConnector>,
    /// Same-device broadcast hub.
    pub broadcast: Arc<dyn BroadcastChannel>,
    /// Room registry. Providers built from clones of one context share it.
    pub registry: RoomRegistry,
    /// Process shutdown signal.
    pub shutdown: Option<watch::Receiver<bool>>,
    /// Awareness to use instead of a fresh one.
    pub awareness: Option<Arc<Awareness>>,
}

impl ProviderContext {
    /// Context with a fresh registry and no shutdown signal.
    pub fn new(mesh: Arc<dyn MeshConnector>, broadcast: Arc<dyn BroadcastChannel>) -> Self {
        Self {
            mesh,
            broadcast,
            registry: RoomRegistry::new(),
            shutdown: None,
            awareness: None,
        }
    }

    /// Use `registry`.
    pub fn with_registry(mut self, registry: RoomRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Disconnect when `shutdown` flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Use an existing awareness.
    pub fn with_awareness(mut self, awareness: Arc<Awareness>) -> Self {
        self.awareness = Some(awareness);
        self
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("registry", &self.registry)
            .field("shutdown", &self.shutdown.is_some())
            .finish_non_exhaustive()
    }
}

struct ProviderInner {
    room: Room,
    registry: RoomRegistry,
    unregistered: AtomicBool,
    doc_watch: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderInner {
    async fn destroy(&self) {
        self.room.destroy().await;
        if !self.unregistered.swap(true, Ordering::SeqCst) {
            self.registry.unregister(self.room.name());
            info!(room = self.room.name(), "provider destroyed");
        }
    }
}

/// Syncs one document over one room.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    /// Build a provider for `doc`.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::Config`] if the configuration is invalid
    /// - [`ProviderError::Registry`] if the room is already in use in this
    ///   registry
    /// - [`ProviderError::Crypto`] if key derivation fails
    /// - [`ProviderError::Transport`] if the mesh cannot be joined or the
    ///   initial connect fails
    pub async fn new(
        config: ProviderConfig,
        doc: Arc<dyn Document>,
        ctx: ProviderContext,
    ) -> Result<Self, ProviderError> {
        config.validate()?;
        let name = config.room_name();
        let reservation = ctx.registry.reserve(&name)?;

        let key = match config.password() {
            Some(password) => Some(derive_key(&name, password, &config).await?),
            None => {
                debug!(room = %name, "no password, broadcast channel is unencrypted");
                None
            }
        };

        let awareness = ctx
            .awareness
            .clone()
            .unwrap_or_else(|| Arc::new(Awareness::new(doc.client_id())));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let room = Room::open(RoomSetup {
            name: name.clone(),
            doc: doc.clone(),
            awareness,
            key,
            mesh: ctx.mesh.clone(),
            broadcast: ctx.broadcast.clone(),
            mesh_options: MeshOptions {
                app_id: config.app_id.clone(),
                max_conns: config.max_conns,
            },
            filter_bc_conns: config.filter_bc_conns,
            awareness_timeout: config.awareness_timeout(),
            events,
            shutdown: ctx.shutdown.clone(),
        })
        .await?;
        reservation.activate(Arc::new(room.clone()));

        let inner = Arc::new(ProviderInner {
            room,
            registry: ctx.registry.clone(),
            unregistered: AtomicBool::new(false),
            doc_watch: Mutex::new(None),
        });
        let watch = spawn_doc_watch(Arc::downgrade(&inner), doc.destroyed());
        *inner.doc_watch.lock().await = Some(watch);

        let provider = Self { inner };
        if config.connect {
            if let Err(e) = provider.connect().await {
                provider.destroy().await;
                return Err(e);
            }
        } else {
            provider.disconnect().await;
        }
        info!(room = %name, connected = config.connect, "provider ready");
        Ok(provider)
    }

    /// Connect the room. No-op when connected.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        self.inner.room.connect().await
    }

    /// Disconnect the room. No-op when disconnected.
    pub async fn disconnect(&self) {
        self.inner.room.disconnect().await;
    }

    /// Disconnect, release the shutdown hook and free the room name.
    /// Idempotent. Also runs when the document is destroyed.
    pub async fn destroy(&self) {
        if let Some(watch) = self.inner.doc_watch.lock().await.take() {
            watch.abort();
        }
        self.inner.destroy().await;
    }

    /// Receive future [`ProviderEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.room.subscribe()
    }

    /// The underlying room session.
    pub fn room(&self) -> &Room {
        &self.inner.room
    }

    /// Full room name.
    pub fn room_name(&self) -> &str {
        self.inner.room.name()
    }

    /// The document's awareness.
    pub fn awareness(&self) -> &Arc<Awareness> {
        self.inner.room.awareness()
    }

    /// Id announced to same-device peers.
    pub fn presence_id(&self) -> &PeerId {
        self.inner.room.presence_id()
    }

    /// True between connect and disconnect.
    pub async fn is_connected(&self) -> bool {
        self.inner.room.is_connected().await
    }

    /// Last reported room-wide synced state.
    pub async fn is_synced(&self) -> bool {
        self.inner.room.is_synced().await
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("room", &self.inner.room)
            .finish_non_exhaustive()
    }
}

async fn derive_key(
    room_name: &str,
    password: &str,
    config: &ProviderConfig,
) -> Result<RoomKey, ProviderError> {
    let room_name = room_name.to_string();
    let password = Zeroizing::new(password.to_string());
    let params = config.argon2_params();
    debug!(room = %room_name, memory_mib = params.memory_mib(), "deriving room key");

    let key = tokio::task::spawn_blocking(move || RoomKey::derive(&room_name, &password, params))
        .await
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))??;
    Ok(key)
}

fn spawn_doc_watch(
    provider: Weak<ProviderInner>,
    mut destroyed: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *destroyed.borrow_and_update() {
                break;
            }
            if destroyed.changed().await.is_err() {
                return;
            }
        }
        if let Some(provider) = provider.upgrade() {
            debug!(room = provider.room.name(), "document destroyed");
            // Detached so that aborting this watcher cannot cut it short.
            tokio::spawn(async move { provider.destroy().await });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::document::YrsDocument;
    use crate::registry::RegistryError;
    use crate::transport::{MemoryBroadcast, MemoryMesh};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn context() -> (ProviderContext, MemoryMesh, MemoryBroadcast) {
        let mesh = MemoryMesh::new();
        let hub = MemoryBroadcast::new();
        let ctx = ProviderContext::new(Arc::new(mesh.clone()), Arc::new(hub.clone()));
        (ctx, mesh, hub)
    }

    fn config(room: &str) -> ProviderConfig {
        ProviderConfig::new(room).with_argon2_ram_mb(0)
    }

    #[tokio::test]
    async fn connects_by_default() {
        let (ctx, mesh, _hub) = context();
        let provider = Provider::new(config("notes"), Arc::new(YrsDocument::new()), ctx)
            .await
            .unwrap();

        assert!(provider.is_connected().await);
        assert_eq!(provider.room_name(), "duplex-sync-notes");
        assert_eq!(mesh.peers("duplex-sync-notes").len(), 1);
    }

    #[tokio::test]
    async fn connect_false_leaves_mesh() {
        let (ctx, mesh, _hub) = context();
        let provider = Provider::new(
            config("notes").with_connect(false),
            Arc::new(YrsDocument::new()),
            ctx,
        )
        .await
        .unwrap();

        assert!(!provider.is_connected().await);
        assert!(mesh.peers("duplex-sync-notes").is_empty());

        provider.connect().await.unwrap();
        assert!(provider.is_connected().await);
        assert_eq!(mesh.peers("duplex-sync-notes").len(), 1);
    }

    #[tokio::test]
    async fn mesh_options_come_from_config() {
        let (ctx, mesh, _hub) = context();
        let _provider = Provider::new(
            config("notes").with_app_id("acme").with_max_conns(7),
            Arc::new(YrsDocument::new()),
            ctx,
        )
        .await
        .unwrap();

        let (room, options) = mesh.joins().remove(0);
        assert_eq!(room, "acme-notes");
        assert_eq!(options.app_id, "acme");
        assert_eq!(options.max_conns, 7);
    }

    #[tokio::test]
    async fn duplicate_room_is_rejected() {
        let (ctx, _mesh, _hub) = context();
        let _first = Provider::new(config("notes"), Arc::new(YrsDocument::new()), ctx.clone())
            .await
            .unwrap();

        let second = Provider::new(config("notes"), Arc::new(YrsDocument::new()), ctx).await;
        let Err(ProviderError::Registry(RegistryError::DuplicateRoom(name))) = second else {
            panic!("expected a duplicate room error");
        };
        assert_eq!(name, "duplex-sync-notes");
    }

    #[tokio::test]
    async fn destroy_frees_the_room_name() {
        let (ctx, _mesh, _hub) = context();
        let first = Provider::new(config("notes"), Arc::new(YrsDocument::new()), ctx.clone())
            .await
            .unwrap();
        first.destroy().await;
        first.destroy().await;

        assert!(!ctx.registry.contains("duplex-sync-notes"));
        let again = Provider::new(config("notes"), Arc::new(YrsDocument::new()), ctx).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn failed_mesh_join_releases_reservation() {
        let (ctx, mesh, _hub) = context();
        mesh.fail_next_join("no signalling");

        let result =
            Provider::new(config("notes"), Arc::new(YrsDocument::new()), ctx.clone()).await;
        assert!(matches!(result, Err(ProviderError::Transport(_))));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let (ctx, _mesh, _hub) = context();
        let result = Provider::new(config(" "), Arc::new(YrsDocument::new()), ctx.clone()).await;
        assert!(matches!(
            result,
            Err(ProviderError::Config(ConfigError::MissingRoomName))
        ));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn destroying_the_document_destroys_the_provider() {
        let (ctx, _mesh, _hub) = context();
        let doc = Arc::new(YrsDocument::new());
        let provider = Provider::new(config("notes"), doc.clone(), ctx.clone())
            .await
            .unwrap();

        doc.destroy();
        timeout(Duration::from_secs(5), async {
            while ctx.registry.contains("duplex-sync-notes") {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!provider.is_connected().await);
    }

    #[tokio::test]
    async fn shared_awareness_is_used() {
        let (ctx, _mesh, _hub) = context();
        let doc = Arc::new(YrsDocument::new());
        let awareness = Arc::new(Awareness::new(doc.client_id()));
        let provider = Provider::new(config("notes"), doc, ctx.with_awareness(awareness.clone()))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(provider.awareness(), &awareness));
    }

    #[tokio::test]
    async fn password_derives_a_key() {
        let (ctx, _mesh, hub) = context();
        let _provider = Provider::new(
            config("notes").with_password("pw"),
            Arc::new(YrsDocument::new()),
            ctx,
        )
        .await
        .unwrap();

        let key = RoomKey::derive(
            "duplex-sync-notes",
            "pw",
            crate::crypto::Argon2Params::minimal(),
        )
        .unwrap();
        for (_, payload) in hub.published() {
            assert!(key.open(&payload).is_ok());
        }
    }
}
