//! Error types for the duplex-sync wire format.

use thiserror::Error;

/// Errors produced while decoding a frame.
///
/// Every variant is recoverable at the session level: the offending frame is
/// dropped and the connection keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame ended early or carried an impossible length/varint.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The leading message tag is outside the defined set.
    #[error("unknown message tag: {0}")]
    UnknownMessageTag(u64),

    /// A sync frame carried an unknown sub-tag.
    #[error("unknown sync message tag: {0}")]
    UnknownSyncTag(u64),
}

impl FrameError {
    pub(crate) fn unexpected_end(what: &str) -> Self {
        Self::Malformed(format!("unexpected end of buffer while reading {what}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = FrameError::UnknownMessageTag(99);
        assert_eq!(err.to_string(), "unknown message tag: 99");

        let err = FrameError::unexpected_end("varuint");
        assert_eq!(
            err.to_string(),
            "malformed frame: unexpected end of buffer while reading varuint"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FrameError>();
    }
}
