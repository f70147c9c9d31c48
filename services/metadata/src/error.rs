//! Error types for the metadata store.
//!
//! Missing blobs are not errors: a catalog with no current pointer or an
//! unknown version reads as empty. Everything that reaches a caller through
//! these types is either a rejected write, a concurrency conflict, a blob
//! that exists but cannot be parsed, or a storage backend failure.

use thiserror::Error;

/// Errors raised by a [`BlobStore`](crate::blob_store::BlobStore) backend
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Write precondition failed for {path}")]
    PreconditionFailed { path: String },

    #[error("Blob store operation on {path} failed: {source}")]
    Backend {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BlobError {
    pub fn backend(path: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        BlobError::Backend {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Errors surfaced by catalog and manifest operations
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Corrupt blob at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Concurrent write detected on {path}")]
    WriteConflict { path: String },

    #[error("Failed to serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {what} as parquet: {source}")]
    Export {
        what: &'static str,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error(transparent)]
    Storage(BlobError),
}

impl CatalogError {
    /// Whether the operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogError::WriteConflict { .. })
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            CatalogError::Validation(_) => "VALIDATION_ERROR",
            CatalogError::Corrupt { .. } => "CORRUPT_BLOB",
            CatalogError::WriteConflict { .. } => "WRITE_CONFLICT",
            CatalogError::Serialization { .. } => "SERIALIZATION_ERROR",
            CatalogError::Export { .. } => "EXPORT_ERROR",
            CatalogError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<BlobError> for CatalogError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::PreconditionFailed { path } => CatalogError::WriteConflict { path },
            other => CatalogError::Storage(other),
        }
    }
}

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;
