//! Error types for Tandem
//!
//! This module defines:
//! - `TandemError`: the error taxonomy shared by every component
//! - `TandemResult`: the single result type returned by async operations
//! - Wire kinds used when an error has to travel inside an event payload

use crate::crypto::CryptoError;

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum TandemError {
    /// A lock handler answered for a different request than the one awaited
    #[error("target mismatch: expected request '{expected}', got '{actual}'")]
    TargetMismatch { expected: String, actual: String },

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("timed out after {after_ms}ms waiting on request '{request_id}'")]
    Timeout { request_id: String, after_ms: u64 },

    #[error("sync of '{target}' failed: {reason}")]
    SyncFailed { target: String, reason: String },

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for every fallible Tandem operation
pub type TandemResult<T> = Result<T, TandemError>;

pub const KIND_INVALID_TOKEN: &str = "invalid_token";
pub const KIND_TARGET_MISMATCH: &str = "target_mismatch";
pub const KIND_TRANSPORT_UNAVAILABLE: &str = "transport_unavailable";
pub const KIND_SYNC_FAILED: &str = "sync_failed";

impl TandemError {
    /// Short machine-readable kind, used in `:error` event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            TandemError::InvalidToken(_) => KIND_INVALID_TOKEN,
            TandemError::TargetMismatch { .. } => KIND_TARGET_MISMATCH,
            TandemError::TransportUnavailable(_) => KIND_TRANSPORT_UNAVAILABLE,
            _ => KIND_SYNC_FAILED,
        }
    }

    /// Rebuild an error reported by a peer for `target`
    pub fn from_peer(kind: &str, target: &str, message: String) -> Self {
        match kind {
            KIND_INVALID_TOKEN => TandemError::InvalidToken(message),
            KIND_TRANSPORT_UNAVAILABLE => TandemError::TransportUnavailable(message),
            _ => TandemError::SyncFailed {
                target: target.to_string(),
                reason: message,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TandemError::Timeout { .. })
    }
}
