//! Content-addressed local blob storage for contact photos
//!
//! Blobs are stored as files named by their SHA256 hash, sharded into
//! subdirectories by hash prefix. A local blob reference is the hash string
//! itself; once a blob has been uploaded, records carry the remote URL
//! instead, so the two are trivially distinguishable.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::StorageError;

/// Prefix of every local blob reference.
pub const BLOB_REF_PREFIX: &str = "sha256-";

/// Whether a blob reference points at the local store (vs. a remote URL).
pub fn is_local_ref(blob_ref: &str) -> bool {
    blob_ref.starts_with(BLOB_REF_PREFIX)
}

/// Blob storage manager
pub struct BlobStore {
    /// Root directory for blob storage
    root_dir: PathBuf,
}

impl BlobStore {
    /// Create a new blob store at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, StorageError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;
        info!(path = %root_dir.display(), "Initialized blob store");
        Ok(Self { root_dir })
    }

    /// Compute SHA256 hash of data
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{}{}", BLOB_REF_PREFIX, hex::encode(hasher.finalize()))
    }

    /// Path for a blob by hash. The first hash characters shard the
    /// directory for better filesystem distribution.
    fn blob_path(&self, hash: &str) -> PathBuf {
        let hash_part = hash.strip_prefix(BLOB_REF_PREFIX).unwrap_or(hash);
        let subdir = &hash_part[..2.min(hash_part.len())];
        self.root_dir.join(subdir).join(hash)
    }

    /// Store a blob, returning its local reference. Idempotent.
    pub async fn save(&self, data: &[u8]) -> Result<String, StorageError> {
        let hash = Self::compute_hash(data);
        let path = self.blob_path(&hash);

        if fs::metadata(&path).await.is_ok() {
            debug!(hash = %hash, "Blob already exists");
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;

        info!(hash = %hash, size = data.len(), "Stored blob");
        Ok(hash)
    }

    /// Check if a blob exists
    pub async fn exists(&self, hash: &str) -> bool {
        fs::metadata(self.blob_path(hash)).await.is_ok()
    }

    /// Retrieve a blob by hash
    pub async fn get(&self, hash: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.blob_path(hash);
        if fs::metadata(&path).await.is_err() {
            return Err(StorageError::BlobNotFound(hash.to_string()));
        }
        Ok(fs::read(&path).await?)
    }

    /// Delete a blob. Deleting a missing blob is a no-op.
    pub async fn delete(&self, hash: &str) -> Result<(), StorageError> {
        let path = self.blob_path(hash);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(hash = %hash, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
