//! Contact Sync - Offline-first contact record synchronization engine
//!
//! Keeps a durable local copy of the user's contact records and reconciles it
//! with a remote store in the background. The UI only ever talks to the local
//! store; the remote side is eventually consistent.
//!
//! ## Architecture
//!
//! - **RecordService**: The facade the UI calls. Validate, commit locally,
//!   queue the mutation, schedule a drain.
//! - **LocalStore / BlobStore**: Authoritative records and groups in sled,
//!   contact photos as content-addressed files.
//! - **MutationQueue**: Persisted FIFO queue of pending creates, updates and
//!   deletes. Survives restarts.
//! - **SessionGatekeeper**: Guards every remote call with a verified session,
//!   refreshing tokens near expiry and retrying auth-shaped failures.
//! - **SyncOrchestrator**: Drains the queue against the remote store, one
//!   pass at a time, reconciling locally-minted ids with remote-assigned ones.
//!
//! ## Sync Model
//!
//! Local-wins, queue-then-drain: every mutation commits locally first and is
//! visible immediately, online or not. Records created offline carry a
//! `local-` id until the remote create lands, at which point the remote id is
//! rewritten through the record table, group memberships, and any still-queued
//! mutations.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/contact-sync/
//! ├── records.sled/          # Records, groups and the mutation queue
//! ├── blobs/                 # Content-addressed photo storage
//! │   └── ab/sha256-ab12...  # First 2 chars of hash as subdirs
//! └── config.toml            # Configuration
//! ```

pub mod blob_store;
pub mod config;
pub mod error;
pub mod local_store;
pub mod orchestrator;
pub mod queue;
pub mod record;
pub mod remote;
pub mod service;
pub mod session;

// Re-exports
pub use blob_store::BlobStore;
pub use config::SyncConfig;
pub use error::{RemoteError, StorageError, SyncError};
pub use local_store::{LocalStore, LocalStoreStats};
pub use orchestrator::{DrainReport, SyncOrchestrator};
pub use queue::MutationQueue;
pub use record::{Group, MutationAction, QueueItem, Record, RecordDraft, RecordPatch};
pub use remote::{
    InMemoryRemoteBlobStore, InMemoryRemoteStore, InMemorySessionProvider, RemoteBlobStore,
    RemoteStore, SessionProvider,
};
pub use service::{EngineStats, RecordService};
pub use session::{Session, SessionEvent, SessionGatekeeper, SessionState};
