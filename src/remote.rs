//! External collaborator contracts
//!
//! The engine only ever talks to the outside world through these traits:
//! the remote record store, the remote blob store, and the session provider.
//! In-memory implementations live here too so tests (and local development)
//! can run the full engine without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::error::RemoteError;
use crate::record::Record;
use crate::session::{Session, SessionEvent};

/// Remote record store, scoped by the authenticated principal.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a record; the returned copy carries the remote-assigned id.
    async fn create(&self, principal_id: &str, record: &Record) -> Result<Record, RemoteError>;

    /// Overwrite a record by id (last-write-wins).
    async fn update(&self, principal_id: &str, record: &Record) -> Result<Record, RemoteError>;

    /// Delete a record by id.
    async fn delete(&self, principal_id: &str, id: &str) -> Result<(), RemoteError>;

    /// List all records owned by the principal.
    async fn list(&self, principal_id: &str) -> Result<Vec<Record>, RemoteError>;

    /// Server-side search over the principal's records.
    async fn search(&self, principal_id: &str, query: &str) -> Result<Vec<Record>, RemoteError>;
}

/// Remote blob store for contact photos.
#[async_trait::async_trait]
pub trait RemoteBlobStore: Send + Sync {
    /// Upload a blob, returning its remote URL.
    async fn put(&self, data: &[u8]) -> Result<String, RemoteError>;

    /// Delete a blob by URL.
    async fn delete(&self, url: &str) -> Result<(), RemoteError>;
}

/// Authentication/session provider.
#[async_trait::async_trait]
pub trait SessionProvider: Send + Sync {
    /// Current session, if any.
    async fn get_current_session(&self) -> Option<Session>;

    /// Exchange the refresh token for a fresh session.
    async fn refresh(&self) -> Result<Session, RemoteError>;

    /// Invalidate the session.
    async fn sign_out(&self);

    /// Subscribe to session change notifications.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

// ============================================================================
// In-memory remote store
// ============================================================================

/// In-memory remote record store.
///
/// Tracks every call in order, counts concurrently in-flight calls, and can
/// be told to fail the next N mutating calls with a chosen error.
pub struct InMemoryRemoteStore {
    principal_id: String,
    records: Mutex<HashMap<String, Record>>,
    calls: Mutex<Vec<String>>,
    fail_remaining: AtomicU32,
    failure: Mutex<RemoteError>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryRemoteStore {
    pub fn new(principal_id: &str) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            records: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(0),
            failure: Mutex::new(RemoteError::Unavailable("injected".into())),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Add artificial latency to every call, widening race windows in tests.
    pub fn with_latency(principal_id: &str, latency: Duration) -> Self {
        Self {
            latency,
            ..Self::new(principal_id)
        }
    }

    /// Fail the next `count` mutating calls with the given error.
    pub async fn fail_next(&self, count: u32, error: RemoteError) {
        *self.failure.lock().await = error;
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Every call made so far, in order, as `"<op> <target>"`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// High-water mark of concurrently in-flight calls.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of the stored records.
    pub async fn records(&self) -> Vec<Record> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Seed a record directly (bypassing create), for diff tests.
    pub async fn insert_raw(&self, record: Record) {
        self.records.lock().await.insert(record.id.clone(), record);
    }

    async fn begin(&self, principal_id: &str, op: &str, target: &str) -> Result<Flight<'_>, RemoteError> {
        let flight = Flight::start(&self.in_flight, &self.max_in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls.lock().await.push(format!("{} {}", op, target));
        if principal_id != self.principal_id {
            return Err(RemoteError::PermissionDenied(principal_id.to_string()));
        }
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(self.failure.lock().await.clone());
        }
        Ok(flight)
    }
}

/// Tracks one in-flight call; decrements on drop so early returns and
/// errors can never leak the counter.
struct Flight<'a> {
    in_flight: &'a AtomicUsize,
}

impl<'a> Flight<'a> {
    fn start(in_flight: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { in_flight }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create(&self, principal_id: &str, record: &Record) -> Result<Record, RemoteError> {
        let _flight = self.begin(principal_id, "create", &record.name).await?;
        let mut created = record.clone();
        created.id = uuid::Uuid::new_v4().to_string();
        self.records
            .lock()
            .await
            .insert(created.id.clone(), created.clone());
        debug!(id = %created.id, "Remote create");
        Ok(created)
    }

    async fn update(&self, principal_id: &str, record: &Record) -> Result<Record, RemoteError> {
        let _flight = self.begin(principal_id, "update", &record.name).await?;
        let mut records = self.records.lock().await;
        if !records.contains_key(&record.id) {
            return Err(RemoteError::NotFound(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record.clone())
    }

    async fn delete(&self, principal_id: &str, id: &str) -> Result<(), RemoteError> {
        let _flight = self.begin(principal_id, "delete", id).await?;
        self.records
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn list(&self, principal_id: &str) -> Result<Vec<Record>, RemoteError> {
        let _flight = self.begin(principal_id, "list", "*").await?;
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn search(&self, principal_id: &str, query: &str) -> Result<Vec<Record>, RemoteError> {
        let _flight = self.begin(principal_id, "search", query).await?;
        let needle = query.to_lowercase();
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }
}

// ============================================================================
// In-memory remote blob store
// ============================================================================

/// In-memory blob upload target.
pub struct InMemoryRemoteBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicU32,
    uploads: AtomicUsize,
}

impl InMemoryRemoteBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            fail_uploads: AtomicU32::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` uploads.
    pub fn fail_next(&self, count: u32) {
        self.fail_uploads.store(count, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryRemoteBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteBlobStore for InMemoryRemoteBlobStore {
    async fn put(&self, data: &[u8]) -> Result<String, RemoteError> {
        if self.fail_uploads.load(Ordering::SeqCst) > 0 {
            self.fail_uploads.fetch_sub(1, Ordering::SeqCst);
            return Err(RemoteError::Unavailable("blob upload failed".into()));
        }
        let url = format!("https://blobs.example/{}", uuid::Uuid::new_v4());
        self.blobs.lock().await.insert(url.clone(), data.to_vec());
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(url)
    }

    async fn delete(&self, url: &str) -> Result<(), RemoteError> {
        self.blobs.lock().await.remove(url);
        Ok(())
    }
}

// ============================================================================
// In-memory session provider
// ============================================================================

/// Session provider with scriptable refresh behavior.
pub struct InMemorySessionProvider {
    session: Mutex<Option<Session>>,
    fail_refreshes: AtomicU32,
    refresh_count: AtomicUsize,
    events_tx: broadcast::Sender<SessionEvent>,
    session_ttl: Duration,
}

impl InMemorySessionProvider {
    /// Provider holding a valid session for `principal_id`.
    pub fn signed_in(principal_id: &str) -> Self {
        let ttl = Duration::from_secs(3600);
        let (events_tx, _) = broadcast::channel(16);
        Self {
            session: Mutex::new(Some(Session::new(principal_id, ttl))),
            fail_refreshes: AtomicU32::new(0),
            refresh_count: AtomicUsize::new(0),
            events_tx,
            session_ttl: ttl,
        }
    }

    /// Provider with no session at all.
    pub fn signed_out() -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            session: Mutex::new(None),
            fail_refreshes: AtomicU32::new(0),
            refresh_count: AtomicUsize::new(0),
            events_tx,
            session_ttl: Duration::from_secs(3600),
        }
    }

    /// Replace the current session (e.g. with one about to expire).
    pub async fn set_session(&self, session: Option<Session>) {
        *self.session.lock().await = session;
    }

    /// Fail the next `count` refresh attempts.
    pub fn fail_next_refreshes(&self, count: u32) {
        self.fail_refreshes.store(count, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Emit a session event to all subscribers.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait::async_trait]
impl SessionProvider for InMemorySessionProvider {
    async fn get_current_session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    async fn refresh(&self) -> Result<Session, RemoteError> {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_refreshes.load(Ordering::SeqCst) > 0 {
            self.fail_refreshes.fetch_sub(1, Ordering::SeqCst);
            return Err(RemoteError::RefreshFailed("injected".into()));
        }
        let mut guard = self.session.lock().await;
        let principal = guard
            .as_ref()
            .map(|s| s.principal_id.clone())
            .ok_or_else(|| RemoteError::RefreshFailed("no session".into()))?;
        let fresh = Session::new(&principal, self.session_ttl);
        *guard = Some(fresh.clone());
        let _ = self.events_tx.send(SessionEvent::TokenRefreshed);
        Ok(fresh)
    }

    async fn sign_out(&self) {
        *self.session.lock().await = None;
        let _ = self.events_tx.send(SessionEvent::SignedOut);
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> Record {
        Record {
            id: String::new(),
            name: name.to_string(),
            company: None,
            phone: None,
            email: None,
            notes: None,
            photo: None,
            group_ids: vec![],
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_remote_store_scoping() {
        let store = InMemoryRemoteStore::new("alice");
        let err = store.create("mallory", &record("X")).await.unwrap_err();
        assert!(matches!(err, RemoteError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_remote_store_crud_and_log() {
        let store = InMemoryRemoteStore::new("alice");
        let created = store.create("alice", &record("Ada")).await.unwrap();
        assert!(!created.id.is_empty());

        let mut updated = created.clone();
        updated.name = "Ada L".into();
        store.update("alice", &updated).await.unwrap();
        store.delete("alice", &created.id).await.unwrap();

        let calls = store.calls().await;
        assert_eq!(calls[0], "create Ada");
        assert_eq!(calls[1], "update Ada L");
        assert!(calls[2].starts_with("delete "));
    }

    #[tokio::test]
    async fn test_fail_next_injects_errors() {
        let store = InMemoryRemoteStore::new("alice");
        store
            .fail_next(1, RemoteError::Unavailable("down".into()))
            .await;
        assert!(store.create("alice", &record("A")).await.is_err());
        assert!(store.create("alice", &record("A")).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_provider_refresh() {
        let provider = InMemorySessionProvider::signed_in("alice");
        let before = provider.get_current_session().await.unwrap();
        let after = provider.refresh().await.unwrap();
        assert_eq!(after.principal_id, "alice");
        assert_ne!(before.access_token, after.access_token);

        provider.fail_next_refreshes(1);
        assert!(provider.refresh().await.is_err());
    }
}
