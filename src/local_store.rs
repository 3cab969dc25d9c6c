//! Durable local store for records and groups
//!
//! The authoritative copy of every record the UI can see lives here; reads
//! are never served from the remote store. Two sled trees:
//!
//! - `records` — record id → envelope (record + insertion sequence)
//! - `groups`  — group id → group
//!
//! Values are msgpack-encoded. The insertion sequence keeps `get_all` ordering
//! stable across reads and across id reconciliation.

use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::record::{new_local_id, Group, Record, RecordPatch};

/// Envelope persisted per record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    /// Monotonic insertion sequence, preserved across id rewrites
    seq: u64,
    record: Record,
}

/// Record/group store backed by sled.
pub struct LocalStore {
    db: Db,
    records: sled::Tree,
    groups: sled::Tree,
}

impl LocalStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened local store");
        Self::with_db(db)
    }

    /// Build the store on an already-open database (shared with the queue).
    pub fn with_db(db: Db) -> Result<Self, StorageError> {
        let records = db.open_tree("records")?;
        let groups = db.open_tree("groups")?;
        Ok(Self { db, records, groups })
    }

    /// Handle to the underlying database, for collaborators sharing it.
    pub fn db(&self) -> Db {
        self.db.clone()
    }

    /// Insert a record. Records without an id get a fresh local id.
    pub fn put(&self, mut record: Record) -> Result<Record, StorageError> {
        if record.id.is_empty() {
            record.id = new_local_id();
        }
        let seq = match self.load(&record.id)? {
            Some(existing) => existing.seq,
            None => self.db.generate_id()?,
        };
        self.store(&StoredRecord { seq, record: record.clone() })?;
        debug!(id = %record.id, "Stored record");
        Ok(record)
    }

    /// Fetch a record by id.
    pub fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.load(id)?.map(|s| s.record))
    }

    /// All records, in stable insertion order.
    pub fn get_all(&self) -> Result<Vec<Record>, StorageError> {
        let mut stored = Vec::new();
        for item in self.records.iter() {
            let (_, value) = item?;
            stored.push(rmp_serde::from_slice::<StoredRecord>(&value)?);
        }
        stored.sort_by_key(|s| s.seq);
        Ok(stored.into_iter().map(|s| s.record).collect())
    }

    /// Apply a partial update to an existing record.
    pub fn update(&self, id: &str, patch: &RecordPatch) -> Result<Record, StorageError> {
        let mut stored = self
            .load(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        patch.apply_to(&mut stored.record);
        self.store(&stored)?;
        debug!(id = %id, "Updated record");
        Ok(stored.record)
    }

    /// Remove a record.
    pub fn delete(&self, id: &str) -> Result<Record, StorageError> {
        let removed = self
            .records
            .remove(id.as_bytes())?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let stored: StoredRecord = rmp_serde::from_slice(&removed)?;
        debug!(id = %id, "Deleted record");
        Ok(stored.record)
    }

    /// Case-insensitive substring search over name/company/phone/email.
    pub fn search(&self, query: &str) -> Result<Vec<Record>, StorageError> {
        let needle = query.to_lowercase();
        let matches = |field: &Option<String>| {
            field
                .as_deref()
                .map(|v| v.to_lowercase().contains(&needle))
                .unwrap_or(false)
        };
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|r| {
                r.name.to_lowercase().contains(&needle)
                    || matches(&r.company)
                    || matches(&r.phone)
                    || matches(&r.email)
            })
            .collect())
    }

    /// Rewrite a record id everywhere in the store.
    ///
    /// This is the reconciliation primitive: once the remote store assigns a
    /// canonical id, the local id is replaced on the record itself and in
    /// every group membership list. Insertion order is preserved.
    pub fn replace_id(&self, old_id: &str, new_id: &str) -> Result<(), StorageError> {
        if let Some(removed) = self.records.remove(old_id.as_bytes())? {
            let mut stored: StoredRecord = rmp_serde::from_slice(&removed)?;
            stored.record.id = new_id.to_string();
            self.store(&stored)?;
        }

        for item in self.groups.iter() {
            let (key, value) = item?;
            let mut group: Group = rmp_serde::from_slice(&value)?;
            if group.member_ids.iter().any(|m| m == old_id) {
                for member in group.member_ids.iter_mut() {
                    if member == old_id {
                        *member = new_id.to_string();
                    }
                }
                let bytes = rmp_serde::to_vec(&group)?;
                self.groups.insert(key, bytes)?;
            }
        }

        info!(old_id = %old_id, new_id = %new_id, "Reconciled record id");
        Ok(())
    }

    /// Insert or replace a group.
    pub fn put_group(&self, group: &Group) -> Result<(), StorageError> {
        let bytes = rmp_serde::to_vec(group)?;
        self.groups.insert(group.id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Fetch a group by id.
    pub fn get_group(&self, id: &str) -> Result<Option<Group>, StorageError> {
        match self.groups.get(id.as_bytes())? {
            Some(value) => Ok(Some(rmp_serde::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All groups.
    pub fn groups(&self) -> Result<Vec<Group>, StorageError> {
        let mut out = Vec::new();
        for item in self.groups.iter() {
            let (_, value) = item?;
            out.push(rmp_serde::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Store statistics for UI display.
    pub fn stats(&self) -> LocalStoreStats {
        LocalStoreStats {
            records: self.records.len() as u64,
            groups: self.groups.len() as u64,
        }
    }

    /// Flush changes to disk.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<StoredRecord>, StorageError> {
        match self.records.get(id.as_bytes())? {
            Some(value) => Ok(Some(rmp_serde::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn store(&self, stored: &StoredRecord) -> Result<(), StorageError> {
        let bytes = rmp_serde::to_vec(stored)?;
        self.records.insert(stored.record.id.as_bytes(), bytes)?;
        Ok(())
    }
}

/// Local store statistics
#[derive(Debug, Clone)]
pub struct LocalStoreStats {
    pub records: u64,
    pub groups: u64,
}
