//! Contact records, groups and the mutations that move them
//!
//! Records are minted on-device with a `local-` prefixed id and keep that id
//! until the remote store accepts the create and assigns a canonical one.
//! The prefix is reserved: remote ids never start with it, so local and
//! remote identifiers cannot collide.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Reserved prefix for identifiers minted on-device.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Mint a fresh local record id.
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Whether an id was minted locally (not yet known to the remote store).
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// A synchronized contact record.
///
/// The local store owns the authoritative copy; the mutation queue carries
/// snapshots of this struct by value. `updated_at` is a display hint only,
/// never consulted for merge decisions (the policy is local-wins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Local (`local-...`) or remote-assigned id
    pub id: String,
    pub name: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    /// Blob reference for the contact photo: a local content hash
    /// (`sha256-...`) before upload, a remote URL after
    pub photo: Option<String>,
    /// Groups this record belongs to
    pub group_ids: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A contact group. Member ids reference records and are rewritten during
/// id reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub member_ids: Vec<String>,
}

/// Input for creating a record through the facade.
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
    pub name: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    /// Raw photo bytes; the facade persists them to the local blob store
    pub photo_bytes: Option<Vec<u8>>,
    pub group_ids: Vec<String>,
}

/// Partial update applied to an existing record. `None` fields are untouched;
/// `Some(None)` inner values clear the field.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub company: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub email: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub photo: Option<Option<String>>,
    pub group_ids: Option<Vec<String>>,
}

impl RecordDraft {
    /// Validate input before anything is persisted or queued.
    ///
    /// Failures here are synchronous and never reach the mutation queue.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Validation("name is required".into()));
        }
        if let Some(email) = &self.email {
            validate_email(email)?;
        }
        Ok(())
    }
}

impl RecordPatch {
    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(SyncError::Validation("name cannot be empty".into()));
            }
        }
        if let Some(Some(email)) = &self.email {
            validate_email(email)?;
        }
        Ok(())
    }

    /// Apply this patch on top of an existing record.
    pub fn apply_to(&self, record: &mut Record) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(company) = &self.company {
            record.company = company.clone();
        }
        if let Some(phone) = &self.phone {
            record.phone = phone.clone();
        }
        if let Some(email) = &self.email {
            record.email = email.clone();
        }
        if let Some(notes) = &self.notes {
            record.notes = notes.clone();
        }
        if let Some(photo) = &self.photo {
            record.photo = photo.clone();
        }
        if let Some(group_ids) = &self.group_ids {
            record.group_ids = group_ids.clone();
        }
        record.updated_at = Some(Utc::now());
    }
}

fn validate_email(email: &str) -> Result<(), SyncError> {
    let trimmed = email.trim();
    let mut parts = trimmed.splitn(2, '@');
    let user = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    if user.is_empty() || domain.is_empty() || !domain.contains('.') || trimmed.contains(' ') {
        return Err(SyncError::Validation(format!("malformed email: {}", email)));
    }
    Ok(())
}

/// One pending change in the mutation queue.
///
/// The payload is a snapshot taken at enqueue time; the orchestrator resolves
/// the target id against the current local store at drain time in case a
/// prior reconciliation rewrote it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    /// Queue-internal id
    pub id: String,
    pub action: MutationAction,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// The three mutations the remote store understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MutationAction {
    Create(Record),
    Update(Record),
    Delete(String),
}

impl MutationAction {
    /// Id of the record this mutation targets.
    pub fn target_id(&self) -> &str {
        match self {
            MutationAction::Create(r) | MutationAction::Update(r) => &r.id,
            MutationAction::Delete(id) => id,
        }
    }
}
