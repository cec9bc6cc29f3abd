//! CRDT document seam.
//!
//! Sessions only touch the document through [`Document`]: state vectors
//! and updates go in and out as opaque bytes, local changes arrive on an
//! update stream, and destruction is observable. [`YrsDocument`] implements
//! it on top of `yrs`, the Rust port of Yjs.

use duplex_sync_types::ClientId;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

/// Name of the shared text used by [`YrsDocument::insert_text`].
pub const DEFAULT_TEXT: &str = "content";

/// Document engine errors.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The state vector could not be decoded.
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),

    /// The update could not be decoded or integrated.
    #[error("failed to apply update: {0}")]
    UpdateApplicationFailure(String),

    /// The update observer could not be registered.
    #[error("failed to observe updates: {0}")]
    Observe(String),
}

/// Live stream of encoded updates produced by a document.
///
/// The document stops producing into the stream once this value is dropped.
pub struct UpdateSubscription {
    /// Encoded updates, in commit order.
    pub updates: mpsc::UnboundedReceiver<Vec<u8>>,
    _guard: Box<dyn Send + Sync>,
}

impl UpdateSubscription {
    /// Pair a receiver with whatever keeps its producer registered.
    pub fn new(
        updates: mpsc::UnboundedReceiver<Vec<u8>>,
        guard: impl Send + Sync + 'static,
    ) -> Self {
        Self {
            updates,
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for UpdateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSubscription").finish_non_exhaustive()
    }
}

/// A replicated CRDT document.
///
/// Applying the same update twice has the same effect as applying it once,
/// and updates commute. An update that changes nothing produces no event on
/// the update stream.
pub trait Document: Send + Sync {
    /// Id of the local client, also used as the awareness client id.
    fn client_id(&self) -> ClientId;

    /// Encode the current state vector.
    fn encode_state_vector(&self) -> Vec<u8>;

    /// Encode everything the holder of `state_vector` is missing. An empty
    /// slice means "everything".
    fn encode_state_as_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError>;

    /// Integrate a remote update.
    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError>;

    /// Stream every committed change, local or applied from a remote update.
    fn subscribe_updates(&self) -> Result<UpdateSubscription, DocumentError>;

    /// Flips to `true` once the document is destroyed.
    fn destroyed(&self) -> watch::Receiver<bool>;
}

/// [`Document`] backed by a `yrs::Doc`.
pub struct YrsDocument {
    doc: Doc,
    destroyed: watch::Sender<bool>,
}

impl YrsDocument {
    /// Create an empty document with a random client id.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create an empty document with a fixed client id.
    pub fn with_client_id(client_id: ClientId) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    /// Wrap an existing `yrs::Doc`.
    pub fn from_doc(doc: Doc) -> Self {
        let (destroyed, _) = watch::channel(false);
        Self { doc, destroyed }
    }

    /// The wrapped `yrs::Doc`.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Insert `chunk` at `index` in the shared text [`DEFAULT_TEXT`].
    pub fn insert_text(&self, index: u32, chunk: &str) {
        let text = self.doc.get_or_insert_text(DEFAULT_TEXT);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, chunk);
    }

    /// Append `chunk` to the shared text [`DEFAULT_TEXT`].
    pub fn push_text(&self, chunk: &str) {
        let text = self.doc.get_or_insert_text(DEFAULT_TEXT);
        let mut txn = self.doc.transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, chunk);
    }

    /// Current contents of the shared text [`DEFAULT_TEXT`].
    pub fn text(&self) -> String {
        let text = self.doc.get_or_insert_text(DEFAULT_TEXT);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Mark the document destroyed. Sessions bound to it tear down.
    pub fn destroy(&self) {
        self.destroyed.send_replace(true);
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for YrsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsDocument")
            .field("client_id", &self.doc.client_id())
            .finish_non_exhaustive()
    }
}

impl Document for YrsDocument {
    fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn encode_state_as_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector)
                .map_err(|e| DocumentError::InvalidStateVector(e.to_string()))?
        };
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)
            .map_err(|e| DocumentError::UpdateApplicationFailure(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::UpdateApplicationFailure(e.to_string()))
    }

    fn subscribe_updates(&self) -> Result<UpdateSubscription, DocumentError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .doc
            .observe_update_v1(move |_, event| {
                let _ = tx.send(event.update.clone());
            })
            .map_err(|e| DocumentError::Observe(e.to_string()))?;
        Ok(UpdateSubscription::new(rx, subscription))
    }

    fn destroyed(&self) -> watch::Receiver<bool> {
        self.destroyed.subscribe()
    }
}
