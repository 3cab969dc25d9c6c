//! Record service facade
//!
//! The one surface the UI talks to. Every operation follows the same shape:
//! validate, commit locally, queue the mutation, schedule a drain. Reads are
//! answered from the local store only and kick off a background drain so the
//! remote side catches up without blocking anyone.
//!
//! Once a local write has committed, it is never rolled back: an enqueue
//! failure after the commit is logged and the record stays local-only until
//! a force sync picks it up.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::blob_store::{self, BlobStore};
use crate::config::SyncConfig;
use crate::error::{StorageError, SyncError};
use crate::local_store::LocalStore;
use crate::orchestrator::{DrainReport, SyncOrchestrator};
use crate::queue::MutationQueue;
use crate::record::{
    new_local_id, Group, MutationAction, Record, RecordDraft, RecordPatch,
};
use crate::remote::{RemoteBlobStore, RemoteStore, SessionProvider};
use crate::session::{SessionEvent, SessionGatekeeper};

/// Engine counters for UI display.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub records: u64,
    pub groups: u64,
    pub pending_mutations: u64,
}

/// Facade over the local store, queue, gatekeeper and orchestrator.
pub struct RecordService {
    store: Arc<LocalStore>,
    blobs: Arc<BlobStore>,
    queue: Arc<MutationQueue>,
    gatekeeper: Arc<SessionGatekeeper>,
    orchestrator: Arc<SyncOrchestrator>,
    /// Event forwarder + auth follower; aborted when the service drops
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl RecordService {
    /// Wire up the whole engine on the configured storage directory.
    ///
    /// Opens the database and blob store, builds the gatekeeper and
    /// orchestrator, and starts the session event forwarder. The returned
    /// service is ready for UI calls; the auth flag follows session events.
    pub async fn open(
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        remote_blobs: Arc<dyn RemoteBlobStore>,
        provider: Arc<dyn SessionProvider>,
    ) -> Result<Arc<Self>, SyncError> {
        let store = Arc::new(LocalStore::open(config.db_path())?);
        let blobs = Arc::new(BlobStore::new(config.blobs_dir()).await?);
        let queue = Arc::new(MutationQueue::new(&store.db())?);
        let gatekeeper = Arc::new(SessionGatekeeper::new(Arc::clone(&provider), config));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&queue),
            Arc::clone(&gatekeeper),
            remote,
            remote_blobs,
            config,
        ));

        let forwarder = gatekeeper.run_event_forwarder();

        // Keep the auth flag in lockstep with session events
        let signed_in = provider.get_current_session().await.is_some();
        orchestrator.set_has_auth(signed_in);
        let mut events = gatekeeper.subscribe();
        let auth_orchestrator = Arc::clone(&orchestrator);
        let auth_follower = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::SignedIn => auth_orchestrator.set_has_auth(true),
                    SessionEvent::SignedOut => auth_orchestrator.set_has_auth(false),
                    SessionEvent::TokenRefreshed => {}
                }
            }
        });

        info!(storage_dir = %config.storage_dir.display(), "Record service ready");
        Ok(Arc::new(Self {
            store,
            blobs,
            queue,
            gatekeeper,
            orchestrator,
            background: vec![forwarder, auth_follower],
        }))
    }

    /// Build a service from pre-wired collaborators (tests, embedding).
    pub fn from_parts(
        store: Arc<LocalStore>,
        blobs: Arc<BlobStore>,
        queue: Arc<MutationQueue>,
        gatekeeper: Arc<SessionGatekeeper>,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        Self {
            store,
            blobs,
            queue,
            gatekeeper,
            orchestrator,
            background: Vec::new(),
        }
    }

    /// Create a record.
    ///
    /// The record is readable locally the moment this returns, regardless of
    /// connectivity. The photo, if any, lands in the local blob store and is
    /// uploaded during the drain.
    pub async fn create(&self, draft: RecordDraft) -> Result<Record, SyncError> {
        draft.validate()?;

        let photo = match &draft.photo_bytes {
            Some(bytes) => Some(self.blobs.save(bytes).await?),
            None => None,
        };
        let record = Record {
            id: new_local_id(),
            name: draft.name,
            company: draft.company,
            phone: draft.phone,
            email: draft.email,
            notes: draft.notes,
            photo,
            group_ids: draft.group_ids,
            updated_at: Some(chrono::Utc::now()),
        };

        let record = self.store.put(record)?;
        self.queue_mutation(MutationAction::Create(record.clone())).await;
        Ok(record)
    }

    /// Apply a partial update. Local-wins: the local copy is overwritten
    /// immediately and the snapshot queued for the remote store.
    pub async fn update(&self, id: &str, patch: RecordPatch) -> Result<Record, SyncError> {
        patch.validate()?;
        let updated = self.store.update(id, &patch)?;
        self.queue_mutation(MutationAction::Update(updated.clone())).await;
        Ok(updated)
    }

    /// Replace a record's photo with fresh bytes.
    pub async fn set_photo(&self, id: &str, bytes: &[u8]) -> Result<Record, SyncError> {
        let blob_ref = self.blobs.save(bytes).await?;
        let patch = RecordPatch {
            photo: Some(Some(blob_ref)),
            ..Default::default()
        };
        let updated = self.store.update(id, &patch)?;
        self.queue_mutation(MutationAction::Update(updated.clone())).await;
        Ok(updated)
    }

    /// Delete a record: local blobs first, then the record, then the queued
    /// remote delete.
    ///
    /// Blob cleanup failures never block the delete.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if let Some(photo) = &record.photo {
            if blob_store::is_local_ref(photo) {
                if let Err(e) = self.blobs.delete(photo).await {
                    warn!(blob = %photo, error = %e, "Failed to delete local photo blob");
                }
            }
        }

        self.store.delete(id)?;
        self.queue_mutation(MutationAction::Delete(record.id)).await;
        Ok(())
    }

    /// Fetch one record from the local store.
    pub fn get(&self, id: &str) -> Result<Option<Record>, SyncError> {
        Ok(self.store.get(id)?)
    }

    /// All records, local truth, stable order. Kicks off a background drain.
    pub fn get_all(&self) -> Result<Vec<Record>, SyncError> {
        let records = self.store.get_all()?;
        self.orchestrator.spawn_drain();
        Ok(records)
    }

    /// Local substring search. Kicks off a background drain.
    pub fn search(&self, query: &str) -> Result<Vec<Record>, SyncError> {
        let records = self.store.search(query)?;
        self.orchestrator.spawn_drain();
        Ok(records)
    }

    /// Insert or replace a group.
    pub fn put_group(&self, group: &Group) -> Result<(), SyncError> {
        Ok(self.store.put_group(group)?)
    }

    pub fn get_group(&self, id: &str) -> Result<Option<Group>, SyncError> {
        Ok(self.store.get_group(id)?)
    }

    pub fn groups(&self) -> Result<Vec<Group>, SyncError> {
        Ok(self.store.groups()?)
    }

    /// Push everything the remote store is missing, then drain.
    pub async fn force_sync(&self) -> Result<DrainReport, SyncError> {
        self.orchestrator.force_sync_all().await
    }

    /// Tear the session down: cancel scheduled drains, drop the queue, and
    /// sign out of the provider. Local records stay on disk.
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.orchestrator.teardown().await;
        self.queue.clear()?;
        self.gatekeeper.sign_out().await;
        Ok(())
    }

    pub fn set_online(&self, online: bool) {
        self.orchestrator.set_is_online(online);
    }

    pub fn stats(&self) -> EngineStats {
        let store = self.store.stats();
        EngineStats {
            records: store.records,
            groups: store.groups,
            pending_mutations: self.queue.len() as u64,
        }
    }

    /// Flush local storage to disk.
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.store.flush().await?;
        Ok(())
    }

    /// Whether any background task has stopped (diagnostics).
    pub fn background_healthy(&self) -> bool {
        self.background.iter().all(|h| !h.is_finished())
    }

    /// Queue a mutation for an already-committed local write.
    ///
    /// Skipped entirely while unauthenticated (a later force sync diffs the
    /// stores instead). An enqueue failure is logged, never propagated: the
    /// local write stands either way.
    async fn queue_mutation(&self, action: MutationAction) {
        if !self.orchestrator.has_auth() {
            debug!(target = %action.target_id(), "Unauthenticated, mutation not queued");
            return;
        }
        if let Err(e) = self.queue.enqueue(action) {
            warn!(error = %e, "Failed to queue mutation; record is local-only until force sync");
            return;
        }
        self.orchestrator.schedule_drain().await;
    }
}

impl Drop for RecordService {
    fn drop(&mut self) {
        for handle in &self.background {
            handle.abort();
        }
    }
}
