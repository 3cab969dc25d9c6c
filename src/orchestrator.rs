//! Sync orchestrator
//!
//! Drains the mutation queue against the remote store. One drain runs at a
//! time, process-wide: the `drain_lock` guard is the `syncing` flag, and
//! dropping it on any exit path (including panic unwind) is the guaranteed
//! release. Individual item failures never abort a drain; each item carries
//! its own retry counter and is dead-lettered past the ceiling.
//!
//! Id reconciliation happens here: when the remote store accepts a create for
//! a locally-minted id, the remote id replaces the local one in the record
//! table, in group membership lists, and in any later queue items that still
//! reference it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blob_store::{self, BlobStore};
use crate::config::SyncConfig;
use crate::error::{RemoteError, StorageError, SyncError};
use crate::local_store::LocalStore;
use crate::queue::MutationQueue;
use crate::record::{is_local_id, MutationAction, QueueItem, Record, RecordPatch};
use crate::remote::{RemoteBlobStore, RemoteStore};
use crate::session::SessionGatekeeper;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items sent successfully and removed from the queue
    pub processed: usize,
    /// Items left queued with an incremented retry counter
    pub failed: usize,
    /// Items dropped permanently after exceeding the retry ceiling
    pub dead_lettered: usize,
    /// True when the pass did not run (offline, unauthenticated, or a drain
    /// was already in flight)
    pub skipped: bool,
    /// True when the pass stopped early because no usable session could be
    /// obtained; remaining items keep their retry budget
    pub paused: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// The background synchronization engine.
pub struct SyncOrchestrator {
    store: Arc<LocalStore>,
    blobs: Arc<BlobStore>,
    queue: Arc<MutationQueue>,
    gatekeeper: Arc<SessionGatekeeper>,
    remote: Arc<dyn RemoteStore>,
    remote_blobs: Arc<dyn RemoteBlobStore>,

    /// Held for the duration of a drain; `try_lock` failure means a drain is
    /// already running and the trigger is a no-op
    drain_lock: Mutex<()>,
    has_auth: AtomicBool,
    is_online: AtomicBool,

    retry_ceiling: u32,
    drain_debounce: Duration,
    /// Debounced drain task; replaced (aborted) by each new local write
    pending_drain: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<LocalStore>,
        blobs: Arc<BlobStore>,
        queue: Arc<MutationQueue>,
        gatekeeper: Arc<SessionGatekeeper>,
        remote: Arc<dyn RemoteStore>,
        remote_blobs: Arc<dyn RemoteBlobStore>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            queue,
            gatekeeper,
            remote,
            remote_blobs,
            drain_lock: Mutex::new(()),
            has_auth: AtomicBool::new(false),
            is_online: AtomicBool::new(true),
            retry_ceiling: config.retry_ceiling,
            drain_debounce: config.drain_debounce(),
            pending_drain: Mutex::new(None),
        }
    }

    pub fn has_auth(&self) -> bool {
        self.has_auth.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::SeqCst)
    }

    /// Flip the auth flag; gaining auth while online schedules a drain.
    pub fn set_has_auth(self: &Arc<Self>, has_auth: bool) {
        self.has_auth.store(has_auth, Ordering::SeqCst);
        if has_auth && self.is_online() {
            self.spawn_drain();
        }
    }

    /// Flip the connectivity flag; coming online schedules a drain.
    pub fn set_is_online(self: &Arc<Self>, is_online: bool) {
        self.is_online.store(is_online, Ordering::SeqCst);
        if is_online && self.has_auth() {
            self.spawn_drain();
        }
    }

    /// Schedule a debounced drain, replacing any not-yet-fired one so a
    /// burst of edits coalesces into a single remote round trip.
    pub async fn schedule_drain(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        let delay = self.drain_debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            orchestrator.drain().await;
        });

        let mut pending = self.pending_drain.lock().await;
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    /// Fire-and-forget drain, used on reads. Never blocks the caller.
    pub fn spawn_drain(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.drain().await;
        });
    }

    /// One complete pass over the queue.
    ///
    /// Returns immediately (skipped) when offline, unauthenticated, or a
    /// drain is already in flight. Unexpected storage errors are logged, not
    /// propagated; the lock guard is released on every path.
    pub async fn drain(self: &Arc<Self>) -> DrainReport {
        if !self.has_auth() || !self.is_online() {
            debug!(
                has_auth = self.has_auth(),
                is_online = self.is_online(),
                "Drain skipped"
            );
            return DrainReport::skipped();
        }

        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already in flight");
            return DrainReport::skipped();
        };

        match self.drain_locked().await {
            Ok(report) => {
                if report.processed + report.failed + report.dead_lettered > 0 {
                    info!(
                        processed = report.processed,
                        failed = report.failed,
                        dead_lettered = report.dead_lettered,
                        "Drain pass finished"
                    );
                }
                report
            }
            Err(e) => {
                error!(error = %e, "Drain pass aborted");
                DrainReport::default()
            }
        }
    }

    async fn drain_locked(&self) -> Result<DrainReport, StorageError> {
        let mut report = DrainReport::default();
        // Local ids reconciled during this pass; later items in the same
        // snapshot must target the rewritten id
        let mut rewrites: HashMap<String, String> = HashMap::new();

        for mut item in self.queue.list_pending()? {
            if apply_rewrites(&mut item, &rewrites) {
                // Superseded by a reconciliation earlier in this pass; the
                // retarget already dropped the persisted copy
                self.queue.remove(&item.id)?;
                continue;
            }

            match self.process_item(&item, &mut rewrites).await {
                Ok(()) => {
                    self.queue.remove(&item.id)?;
                    report.processed += 1;
                }
                Err(SyncError::Remote(
                    e @ (RemoteError::RefreshFailed(_) | RemoteError::NotSignedIn),
                )) => {
                    // No usable session. Stop the pass and leave every retry
                    // counter alone: nothing was attempted against the remote
                    // store, so nothing should burn retry budget.
                    warn!(error = %e, "No usable session, pausing drain");
                    self.has_auth.store(false, Ordering::SeqCst);
                    report.paused = true;
                    break;
                }
                Err(e) => {
                    let retries = item.retry_count + 1;
                    if retries > self.retry_ceiling {
                        warn!(
                            item_id = %item.id,
                            target = %item.action.target_id(),
                            retries = retries,
                            error = %e,
                            "Dead-lettering queue item"
                        );
                        self.queue.remove(&item.id)?;
                        report.dead_lettered += 1;
                    } else {
                        debug!(
                            item_id = %item.id,
                            retries = retries,
                            error = %e,
                            "Queue item failed, will retry"
                        );
                        self.queue.update_retry(&item.id, retries)?;
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn process_item(
        &self,
        item: &QueueItem,
        rewrites: &mut HashMap<String, String>,
    ) -> Result<(), SyncError> {
        match &item.action {
            MutationAction::Create(record) => {
                self.push_create(record, rewrites).await?;
                Ok(())
            }
            MutationAction::Update(record) => {
                if is_local_id(&record.id) {
                    // The create for this record has not landed yet; send the
                    // freshest payload as the create instead
                    self.push_create(record, rewrites).await?;
                    return Ok(());
                }
                match self.push_update(record).await {
                    Ok(()) => Ok(()),
                    Err(RemoteError::NotFound(_)) => {
                        // Remote record vanished; recreate rather than lose
                        // the user's data
                        warn!(id = %record.id, "Remote record missing on update, recreating");
                        self.push_create(record, rewrites).await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            MutationAction::Delete(id) => {
                if is_local_id(id) {
                    // Never created remotely; nothing to delete there
                    debug!(id = %id, "Skipping remote delete of unsynced record");
                    return Ok(());
                }
                match self.push_delete(id).await {
                    // Already gone remotely; treat as done
                    Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Send a create (uploading the photo blob first) and reconcile ids.
    async fn push_create(
        &self,
        record: &Record,
        rewrites: &mut HashMap<String, String>,
    ) -> Result<(), SyncError> {
        let mut outgoing = record.clone();

        // Blob upload failure is non-fatal: keep the local reference and let
        // a later pass (or a manual re-save) try again
        if let Some(photo) = outgoing.photo.clone() {
            if blob_store::is_local_ref(&photo) {
                match self.upload_photo(&photo).await {
                    Ok(url) => outgoing.photo = Some(url),
                    Err(e) => {
                        warn!(blob = %photo, error = %e, "Photo upload failed, keeping local reference");
                    }
                }
            }
        }

        let remote = Arc::clone(&self.remote);
        let payload = outgoing.clone();
        let created = self
            .gatekeeper
            .with_verified_session(move |principal| {
                let remote = Arc::clone(&remote);
                let payload = payload.clone();
                async move { remote.create(&principal, &payload).await }
            })
            .await?;

        self.reconcile(&record.id, &created, &outgoing)?;
        rewrites.insert(record.id.clone(), created.id.clone());
        Ok(())
    }

    async fn push_update(&self, record: &Record) -> Result<(), RemoteError> {
        let remote = Arc::clone(&self.remote);
        let payload = record.clone();
        self.gatekeeper
            .with_verified_session(move |principal| {
                let remote = Arc::clone(&remote);
                let payload = payload.clone();
                async move { remote.update(&principal, &payload).await.map(|_| ()) }
            })
            .await
    }

    async fn push_delete(&self, id: &str) -> Result<(), RemoteError> {
        let remote = Arc::clone(&self.remote);
        let id = id.to_string();
        self.gatekeeper
            .with_verified_session(move |principal| {
                let remote = Arc::clone(&remote);
                let id = id.clone();
                async move { remote.delete(&principal, &id).await }
            })
            .await
    }

    async fn upload_photo(&self, local_ref: &str) -> Result<String, SyncError> {
        let bytes = self.blobs.get(local_ref).await?;
        let url = self.remote_blobs.put(&bytes).await?;
        debug!(blob = %local_ref, url = %url, "Uploaded photo blob");
        Ok(url)
    }

    /// Replace `old_id` with the remote-assigned id across the local store
    /// and the persisted queue, and record the uploaded photo URL.
    fn reconcile(
        &self,
        old_id: &str,
        created: &Record,
        outgoing: &Record,
    ) -> Result<(), StorageError> {
        if old_id != created.id {
            self.store.replace_id(old_id, &created.id)?;
            self.queue.retarget(old_id, &created.id)?;
        }

        // Write back the remote photo URL when the upload swapped out the
        // local hash reference
        if let Some(photo) = &outgoing.photo {
            if !blob_store::is_local_ref(photo) {
                let patch = RecordPatch {
                    photo: Some(Some(photo.clone())),
                    ..Default::default()
                };
                match self.store.update(&created.id, &patch) {
                    Ok(_) => {}
                    Err(StorageError::NotFound(_)) => {
                        // Record was deleted locally while its create drained;
                        // the queued delete will clean up remotely
                        debug!(id = %created.id, "Record gone before photo URL writeback");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Diff local against remote and enqueue creates for anything the remote
    /// store is missing, then drain. UI-invoked "force sync all".
    pub async fn force_sync_all(self: &Arc<Self>) -> Result<DrainReport, SyncError> {
        if !self.has_auth() || !self.is_online() {
            return Ok(DrainReport::skipped());
        }

        let remote = Arc::clone(&self.remote);
        let remote_records = self
            .gatekeeper
            .with_verified_session(move |principal| {
                let remote = Arc::clone(&remote);
                async move { remote.list(&principal).await }
            })
            .await?;
        let remote_ids: HashSet<String> = remote_records.into_iter().map(|r| r.id).collect();

        let pending_targets: HashSet<String> = self
            .queue
            .list_pending()?
            .iter()
            .map(|i| i.action.target_id().to_string())
            .collect();

        for record in self.store.get_all()? {
            let missing_remotely = is_local_id(&record.id) || !remote_ids.contains(&record.id);
            if missing_remotely && !pending_targets.contains(&record.id) {
                info!(id = %record.id, "Enqueueing create for record missing remotely");
                self.queue.enqueue(MutationAction::Create(record))?;
            }
        }

        Ok(self.drain().await)
    }

    /// Cancel any scheduled drain and drop the auth flag (sign-out path).
    pub async fn teardown(&self) {
        if let Some(handle) = self.pending_drain.lock().await.take() {
            handle.abort();
        }
        self.has_auth.store(false, Ordering::SeqCst);
        debug!("Orchestrator torn down");
    }
}

/// Point a stale item snapshot at the id a reconciliation earlier in the
/// pass assigned. Returns true for a create that the reconciliation
/// superseded (the record exists remotely now; replaying the create would
/// duplicate it).
fn apply_rewrites(item: &mut QueueItem, rewrites: &HashMap<String, String>) -> bool {
    let target = item.action.target_id();
    let Some(new_id) = rewrites.get(target) else {
        return false;
    };
    match &mut item.action {
        MutationAction::Create(_) => true,
        MutationAction::Update(r) => {
            r.id = new_id.clone();
            false
        }
        MutationAction::Delete(id) => {
            *id = new_id.clone();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemoteBlobStore, InMemoryRemoteStore, InMemorySessionProvider};
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<LocalStore>,
        blobs: Arc<BlobStore>,
        queue: Arc<MutationQueue>,
        remote: Arc<InMemoryRemoteStore>,
        remote_blobs: Arc<InMemoryRemoteBlobStore>,
        provider: Arc<InMemorySessionProvider>,
        _temp: TempDir,
    }

    async fn harness() -> Harness {
        harness_with(InMemoryRemoteStore::new("alice")).await
    }

    async fn harness_with(remote: InMemoryRemoteStore) -> Harness {
        let temp = TempDir::new().unwrap();
        let config = SyncConfig::for_tests(temp.path().to_path_buf());
        let store = Arc::new(LocalStore::open(config.db_path()).unwrap());
        let blobs = Arc::new(BlobStore::new(config.blobs_dir()).await.unwrap());
        let queue = Arc::new(MutationQueue::new(&store.db()).unwrap());
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        let gatekeeper = Arc::new(SessionGatekeeper::new(
            Arc::clone(&provider) as Arc<dyn crate::remote::SessionProvider>,
            &config,
        ));
        let remote = Arc::new(remote);
        let remote_blobs = Arc::new(InMemoryRemoteBlobStore::new());

        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&queue),
            gatekeeper,
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::clone(&remote_blobs) as Arc<dyn RemoteBlobStore>,
            &config,
        ));
        orchestrator.set_has_auth(true);
        // Let the sign-in drain run against the still-empty queue
        tokio::task::yield_now().await;

        Harness {
            orchestrator,
            store,
            blobs,
            queue,
            remote,
            remote_blobs,
            provider,
            _temp: temp,
        }
    }

    fn record(id: &str, name: &str) -> Record {
        Record {
            id: id.to_string(),
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
    async fn test_drain_create_reconciles_ids() {
        let h = harness().await;
        let local = h.store.put(record("", "Ada")).unwrap();
        assert!(is_local_id(&local.id));
        h.queue
            .enqueue(MutationAction::Create(local.clone()))
            .unwrap();

        let report = h.orchestrator.drain().await;
        assert_eq!(report.processed, 1);
        assert!(h.queue.is_empty());

        // Local id replaced by the remote-assigned one
        assert!(h.store.get(&local.id).unwrap().is_none());
        let all = h.store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(!is_local_id(&all[0].id));
        assert_eq!(h.remote.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_rewrites_later_items_in_same_pass() {
        let h = harness().await;
        let local = h.store.put(record("", "Ada")).unwrap();
        h.queue
            .enqueue(MutationAction::Create(local.clone()))
            .unwrap();
        let mut edited = local.clone();
        edited.name = "Ada L".into();
        h.queue.enqueue(MutationAction::Update(edited)).unwrap();

        let report = h.orchestrator.drain().await;
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 0);

        // The update went to the remote-assigned id, not the stale local one
        let remote_records = h.remote.records().await;
        assert_eq!(remote_records.len(), 1);
        assert_eq!(remote_records[0].name, "Ada L");
        let calls = h.remote.calls().await;
        assert_eq!(calls, vec!["create Ada", "update Ada L"]);
    }

    #[tokio::test]
    async fn test_only_one_drain_runs_at_a_time() {
        let h =
            harness_with(InMemoryRemoteStore::with_latency("alice", Duration::from_millis(50)))
                .await;
        for i in 0..3 {
            let r = h.store.put(record("", &format!("R{}", i))).unwrap();
            h.queue.enqueue(MutationAction::Create(r)).unwrap();
        }

        let (a, b) = tokio::join!(h.orchestrator.drain(), h.orchestrator.drain());
        assert!(a.skipped != b.skipped, "exactly one pass should run");
        assert_eq!(a.processed + b.processed, 3);
        assert_eq!(h.remote.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_drain_skipped_offline_or_unauthenticated() {
        let h = harness().await;
        h.queue
            .enqueue(MutationAction::Create(record("local-a", "A")))
            .unwrap();

        h.orchestrator.set_is_online(false);
        assert!(h.orchestrator.drain().await.skipped);

        h.orchestrator.set_is_online(true);
        h.orchestrator.set_has_auth(false);
        assert!(h.orchestrator.drain().await.skipped);
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_item_retries_then_dead_letters() {
        let h = harness().await;
        let local = h.store.put(record("", "Ada")).unwrap();
        h.queue.enqueue(MutationAction::Create(local)).unwrap();
        h.remote
            .fail_next(100, RemoteError::Unavailable("down".into()))
            .await;

        for expected_retry in 1..=5u32 {
            let report = h.orchestrator.drain().await;
            assert_eq!(report.failed, 1);
            let pending = h.queue.list_pending().unwrap();
            assert_eq!(pending[0].retry_count, expected_retry);
        }

        // Sixth consecutive failure pushes past the ceiling
        let report = h.orchestrator.drain().await;
        assert_eq!(report.dead_lettered, 1);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_item_does_not_block_later_items() {
        let h = harness().await;
        let a = h.store.put(record("", "A")).unwrap();
        let b = h.store.put(record("", "B")).unwrap();
        h.queue.enqueue(MutationAction::Create(a)).unwrap();
        h.queue.enqueue(MutationAction::Create(b)).unwrap();
        h.remote
            .fail_next(1, RemoteError::Unavailable("down".into()))
            .await;

        let report = h.orchestrator.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(h.remote.records().await[0].name, "B");
    }

    #[tokio::test]
    async fn test_update_of_missing_remote_record_recreates() {
        let h = harness().await;
        // A remote id the remote store has never seen (e.g. deleted server-side)
        let ghost = record("dead-beef", "Ghost");
        h.store.put(ghost.clone()).unwrap();
        h.queue.enqueue(MutationAction::Update(ghost)).unwrap();

        let report = h.orchestrator.drain().await;
        assert_eq!(report.processed, 1);
        let remote_records = h.remote.records().await;
        assert_eq!(remote_records.len(), 1);
        assert_eq!(remote_records[0].name, "Ghost");
        // Local store now carries the freshly assigned remote id
        assert!(h.store.get("dead-beef").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_of_unsynced_record_skips_remote() {
        let h = harness().await;
        h.queue
            .enqueue(MutationAction::Delete("local-never-synced".into()))
            .unwrap();

        let report = h.orchestrator.drain().await;
        assert_eq!(report.processed, 1);
        assert!(h.remote.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_photo_uploaded_before_create() {
        let h = harness().await;
        let blob_ref = h.blobs.save(b"jpeg bytes").await.unwrap();
        let mut r = h.store.put(record("", "Ada")).unwrap();
        r.photo = Some(blob_ref);
        let r = h.store.put(r).unwrap();
        h.queue.enqueue(MutationAction::Create(r)).unwrap();

        h.orchestrator.drain().await;

        assert_eq!(h.remote_blobs.upload_count(), 1);
        let remote_records = h.remote.records().await;
        let photo = remote_records[0].photo.as_deref().unwrap();
        assert!(photo.starts_with("https://"));
        // Local copy points at the uploaded URL too
        let local = &h.store.get_all().unwrap()[0];
        assert_eq!(local.photo.as_deref(), Some(photo));
    }

    #[tokio::test]
    async fn test_photo_upload_failure_is_not_fatal() {
        let h = harness().await;
        let blob_ref = h.blobs.save(b"jpeg bytes").await.unwrap();
        let mut r = h.store.put(record("", "Ada")).unwrap();
        r.photo = Some(blob_ref.clone());
        let r = h.store.put(r).unwrap();
        h.queue.enqueue(MutationAction::Create(r)).unwrap();
        h.remote_blobs.fail_next(1);

        let report = h.orchestrator.drain().await;
        assert_eq!(report.processed, 1);
        // Create still landed, carrying the local blob reference
        let remote_records = h.remote.records().await;
        assert_eq!(remote_records[0].photo.as_deref(), Some(blob_ref.as_str()));
    }

    #[tokio::test]
    async fn test_force_sync_all_enqueues_missing_records() {
        let h = harness().await;
        // Synced already: present both sides
        h.remote.insert_raw(record("remote-1", "Synced")).await;
        h.store.put(record("remote-1", "Synced")).unwrap();
        // Present locally only
        h.store.put(record("", "Only local")).unwrap();

        let report = h.orchestrator.force_sync_all().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(h.remote.records().await.len(), 2);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_update_drains_as_create_when_first_create_fails() {
        let h = harness().await;
        let local = h.store.put(record("", "Ada")).unwrap();
        h.queue
            .enqueue(MutationAction::Create(local.clone()))
            .unwrap();
        let mut edited = local.clone();
        edited.name = "Ada L".into();
        h.queue.enqueue(MutationAction::Update(edited)).unwrap();
        h.remote
            .fail_next(1, RemoteError::Unavailable("down".into()))
            .await;

        // The create fails; the update still targets a local id, so it is
        // sent as the create, and the reconciliation drops the superseded
        // original create from the queue
        let report = h.orchestrator.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        let remote_records = h.remote.records().await;
        assert_eq!(remote_records.len(), 1);
        assert_eq!(remote_records[0].name, "Ada L");
        assert!(h.queue.is_empty());

        // A further pass must not mint a second remote record
        let report = h.orchestrator.drain().await;
        assert_eq!(report.processed, 0);
        assert_eq!(h.remote.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unusable_session_pauses_drain_without_burning_retries() {
        let h = harness().await;
        let local = h.store.put(record("", "Ada")).unwrap();
        h.queue.enqueue(MutationAction::Create(local)).unwrap();

        // Hard-expired session and a refresh that keeps failing
        h.provider
            .set_session(Some(crate::session::Session::new("alice", Duration::ZERO)))
            .await;
        h.provider.fail_next_refreshes(100);

        let report = h.orchestrator.drain().await;
        assert!(report.paused);
        assert_eq!(report.failed, 0);
        assert_eq!(report.dead_lettered, 0);
        let pending = h.queue.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
        assert!(h.remote.calls().await.is_empty());

        // The auth flag was dropped, so further passes are no-ops
        assert!(!h.orchestrator.has_auth());
        assert!(h.orchestrator.drain().await.skipped);

        // A working session resumes with the retry budget intact
        h.provider
            .set_session(Some(crate::session::Session::new(
                "alice",
                std::time::Duration::from_secs(3600),
            )))
            .await;
        h.orchestrator.set_has_auth(true);
        let report = h.orchestrator.drain().await;
        assert_eq!(report.processed, 1);
        assert_eq!(h.remote.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_drain_coalesces_bursts() {
        let h = harness().await;
        let r = h.store.put(record("", "Ada")).unwrap();
        h.queue.enqueue(MutationAction::Create(r)).unwrap();

        for _ in 0..5 {
            h.orchestrator.schedule_drain().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.queue.is_empty());
        // One create only; the earlier scheduled drains were replaced
        assert_eq!(h.remote.calls().await, vec!["create Ada".to_string()]);
    }
}
