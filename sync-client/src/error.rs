//! Provider error type.

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::document::DocumentError;
use crate::registry::RegistryError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors returned while building or driving a [`Provider`](crate::Provider).
///
/// Frame, decryption and send failures inside a running session are logged
/// and dropped, never returned.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The room name is already taken in this registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Key derivation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Joining the mesh failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The document rejected a subscription.
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// The provider was destroyed.
    #[error("provider destroyed")]
    Destroyed,
}
