//! Persisted mutation queue
//!
//! Append-only list of pending mutations, drained FIFO. Keys are monotonic
//! sled-generated sequence numbers stored big-endian, so iteration order is
//! enqueue order; the queue itself never reorders. Create-before-update-
//! before-delete ordering for one record therefore survives restarts.
//!
//! Writers: the facade appends, the orchestrator removes and bumps retry
//! counters. Nothing else touches this tree.

use chrono::Utc;
use sled::Db;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::record::{MutationAction, QueueItem};

/// Mutation queue backed by a sled tree.
pub struct MutationQueue {
    db: Db,
    queue: sled::Tree,
}

impl MutationQueue {
    /// Open the queue tree on a shared database.
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        let queue = db.open_tree("sync_queue")?;
        Ok(Self { db: db.clone(), queue })
    }

    /// Append a mutation. The returned item carries its queue-internal id.
    pub fn enqueue(&self, action: MutationAction) -> Result<QueueItem, StorageError> {
        // db-level ids are monotonic across restarts, which is all FIFO needs
        let seq = self.db.generate_id()?;
        let item = QueueItem {
            id: seq.to_string(),
            action,
            enqueued_at: Utc::now(),
            retry_count: 0,
        };
        let bytes = rmp_serde::to_vec(&item)?;
        self.queue.insert(seq.to_be_bytes(), bytes)?;
        debug!(item_id = %item.id, target = %item.action.target_id(), "Enqueued mutation");
        Ok(item)
    }

    /// All pending items in FIFO order.
    pub fn list_pending(&self) -> Result<Vec<QueueItem>, StorageError> {
        let mut items = Vec::new();
        for entry in self.queue.iter() {
            let (_, value) = entry?;
            items.push(rmp_serde::from_slice(&value)?);
        }
        Ok(items)
    }

    /// Remove an item (after successful drain or dead-letter).
    pub fn remove(&self, item_id: &str) -> Result<(), StorageError> {
        let key = Self::key_for(item_id)?;
        self.queue.remove(key.to_be_bytes())?;
        Ok(())
    }

    /// Persist an incremented retry counter.
    pub fn update_retry(&self, item_id: &str, new_count: u32) -> Result<(), StorageError> {
        let key = Self::key_for(item_id)?;
        if let Some(value) = self.queue.get(key.to_be_bytes())? {
            let mut item: QueueItem = rmp_serde::from_slice(&value)?;
            item.retry_count = new_count;
            let bytes = rmp_serde::to_vec(&item)?;
            self.queue.insert(key.to_be_bytes(), bytes)?;
        } else {
            warn!(item_id = %item_id, "Retry update for missing queue item");
        }
        Ok(())
    }

    /// Rewrite payload ids after a reconciliation so later queued mutations
    /// target the record's current id.
    ///
    /// A still-queued create for the old id is dropped instead of rewritten:
    /// the record already exists remotely (that is what the reconciliation
    /// means), and its payload is an older snapshot than the one just sent.
    /// Replaying it would mint a duplicate remote record.
    pub fn retarget(&self, old_id: &str, new_id: &str) -> Result<(), StorageError> {
        for entry in self.queue.iter() {
            let (key, value) = entry?;
            let mut item: QueueItem = rmp_serde::from_slice(&value)?;
            if item.action.target_id() != old_id {
                continue;
            }
            let keep = match &mut item.action {
                MutationAction::Create(_) => false,
                MutationAction::Update(r) => {
                    r.id = new_id.to_string();
                    true
                }
                MutationAction::Delete(id) => {
                    *id = new_id.to_string();
                    true
                }
            };
            if keep {
                let bytes = rmp_serde::to_vec(&item)?;
                self.queue.insert(key, bytes)?;
                debug!(item_id = %item.id, old_id = %old_id, new_id = %new_id, "Retargeted queue item");
            } else {
                self.queue.remove(key)?;
                debug!(item_id = %item.id, old_id = %old_id, "Dropped superseded create");
            }
        }
        Ok(())
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every pending item (sign-out teardown).
    pub fn clear(&self) -> Result<(), StorageError> {
        self.queue.clear()?;
        Ok(())
    }

    fn key_for(item_id: &str) -> Result<u64, StorageError> {
        item_id
            .parse::<u64>()
            .map_err(|_| StorageError::NotFound(format!("queue item {}", item_id)))
    }
}
