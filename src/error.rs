//! Error types for contact-sync

use thiserror::Error;

/// Local persistence failures (records, groups, queue, blobs).
///
/// These are always propagated to the caller; nothing at the storage layer
/// swallows an error. Non-fatal handling (blob cleanup, enqueue-after-commit)
/// happens one layer up in the facade and orchestrator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Failures from the remote record store or the session provider.
///
/// The kind matters: `is_auth()` drives the gatekeeper's retry policy, and
/// `NotFound` on a remote update triggers the create fallback in the
/// orchestrator. Everything else follows the queue item's retry path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Access token expired")]
    TokenExpired,

    #[error("Access token invalid")]
    TokenInvalid,

    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Permission denied for principal {0}")]
    PermissionDenied(String),

    #[error("Remote record not found: {0}")]
    NotFound(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Remote store rejected the call: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether this failure should be retried with a refreshed session.
    ///
    /// Only token-shaped failures qualify. `PermissionDenied` means the
    /// principal genuinely lacks access and a fresh token will not help.
    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::TokenExpired | RemoteError::TokenInvalid)
    }
}

/// Facade-level errors surfaced to the UI.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("No authenticated session")]
    NoSession,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
