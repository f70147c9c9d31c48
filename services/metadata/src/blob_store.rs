use crate::error::BlobError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// A blob fetched from the store together with its entity tag
#[derive(Debug, Clone)]
pub struct BlobObject {
    /// Raw blob content
    pub body: Bytes,
    /// Entity tag used for compare-and-swap writes
    pub etag: Option<String>,
}

/// Listing entry for a stored blob
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    /// Full blob path
    pub path: String,
    /// Blob size in bytes
    pub size_bytes: u64,
    /// Last modification time, when the backend reports one
    pub last_modified: Option<DateTime<Utc>>,
}

/// Precondition attached to a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Overwrite whatever is there
    Unconditional,
    /// Only create; fail if the path already exists
    IfAbsent,
    /// Only replace the blob currently carrying this entity tag
    IfMatch(String),
}

impl WriteCondition {
    /// Condition for replacing a blob that was read with `etag`
    ///
    /// Falls back to an unconditional write when the backend reported no tag.
    pub fn replacing(etag: Option<String>) -> Self {
        match etag {
            Some(etag) => WriteCondition::IfMatch(etag),
            None => WriteCondition::Unconditional,
        }
    }
}

/// Path-addressed object storage used by the catalogs
///
/// Implementations must report an unmet [`WriteCondition`] as
/// [`BlobError::PreconditionFailed`] and a missing blob on `get` as `Ok(None)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob, `None` if it does not exist
    async fn get(&self, path: &str) -> Result<Option<BlobObject>, BlobError>;

    /// Store a blob, returning the new entity tag when the backend reports one
    async fn put(
        &self,
        path: &str,
        body: Bytes,
        condition: WriteCondition,
    ) -> Result<Option<String>, BlobError>;

    /// Check whether a blob exists
    async fn exists(&self, path: &str) -> Result<bool, BlobError>;

    /// List every blob whose path starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>, BlobError>;
}

#[derive(Debug, Clone)]
struct StoredBlob {
    body: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

/// Process-local blob store for tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
    next_etag: AtomicU64,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// All stored paths in lexical order
    pub fn paths(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }

    /// Remove a blob, returning whether it existed
    pub fn remove(&self, path: &str) -> bool {
        self.blobs.write().remove(path).is_some()
    }

    fn issue_etag(&self) -> String {
        format!("\"{}\"", self.next_etag.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, path: &str) -> Result<Option<BlobObject>, BlobError> {
        Ok(self.blobs.read().get(path).map(|blob| BlobObject {
            body: blob.body.clone(),
            etag: Some(blob.etag.clone()),
        }))
    }

    async fn put(
        &self,
        path: &str,
        body: Bytes,
        condition: WriteCondition,
    ) -> Result<Option<String>, BlobError> {
        let mut blobs = self.blobs.write();

        let allowed = match (&condition, blobs.get(path)) {
            (WriteCondition::Unconditional, _) => true,
            (WriteCondition::IfAbsent, existing) => existing.is_none(),
            (WriteCondition::IfMatch(expected), Some(existing)) => existing.etag == *expected,
            (WriteCondition::IfMatch(_), None) => false,
        };

        if !allowed {
            trace!(path = %path, condition = ?condition, "Rejected conditional write");
            return Err(BlobError::PreconditionFailed {
                path: path.to_string(),
            });
        }

        let etag = self.issue_etag();
        blobs.insert(
            path.to_string(),
            StoredBlob {
                body,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );

        Ok(Some(etag))
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        Ok(self.blobs.read().contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>, BlobError> {
        Ok(self
            .blobs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, blob)| ObjectSummary {
                path: path.clone(),
                size_bytes: blob.body.len() as u64,
                last_modified: Some(blob.last_modified),
            })
            .collect())
    }
}
