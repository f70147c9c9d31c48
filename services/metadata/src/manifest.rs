//! Cross-catalog manifest.
//!
//! A single JSON document at `{prefix}/manifest.json` records, for each
//! catalog, the current version id, the blob path of that version and the
//! sha-256 of its content. The manifest has no history: every update
//! replaces it wholesale, guarded by a conditional write so concurrent
//! updaters cannot drop each other's entries.

use crate::blob_store::{BlobStore, WriteCondition};
use crate::error::{CatalogError, Result};
use crate::retry::RetryPolicy;
use crate::version::{manifest_path, CatalogKind, VersionId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const MANIFEST_VERSION: &str = "1.0.0";

/// Lowercase hex sha-256 of `content`
pub fn sha256_hex(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Persisted manifest document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    #[serde(default = "default_manifest_version")]
    pub manifest_version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_exif_corrections: Option<String>,
    #[serde(default)]
    pub current_camera_mapping: Option<String>,
    #[serde(default)]
    pub exif_corrections_file: Option<String>,
    #[serde(default)]
    pub camera_mapping_file: Option<String>,
    #[serde(default)]
    pub exif_corrections_checksum: String,
    #[serde(default)]
    pub camera_mapping_checksum: String,
    #[serde(default)]
    pub processing_version: String,
}

fn default_manifest_version() -> String {
    MANIFEST_VERSION.to_string()
}

/// One catalog's slice of the manifest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub kind: CatalogKind,
    pub version_id: String,
    pub blob_path: String,
    pub checksum: String,
}

impl ManifestEntry {
    /// Parsed version id; `None` for ids written by older tooling that do
    /// not follow the version id format
    pub fn parsed_version(&self) -> Option<VersionId> {
        self.version_id.parse().ok()
    }
}

impl ManifestRecord {
    /// Manifest used before anything has been written
    pub fn bootstrap(processing_version: &str) -> Self {
        Self {
            manifest_version: MANIFEST_VERSION.to_string(),
            created_at: Utc::now(),
            updated_at: None,
            current_exif_corrections: None,
            current_camera_mapping: None,
            exif_corrections_file: None,
            camera_mapping_file: None,
            exif_corrections_checksum: String::new(),
            camera_mapping_checksum: String::new(),
            processing_version: processing_version.to_string(),
        }
    }

    pub fn entry(&self, kind: CatalogKind) -> Option<ManifestEntry> {
        let (version, file, checksum) = match kind {
            CatalogKind::ExifCorrections => (
                &self.current_exif_corrections,
                &self.exif_corrections_file,
                &self.exif_corrections_checksum,
            ),
            CatalogKind::CameraMapping => (
                &self.current_camera_mapping,
                &self.camera_mapping_file,
                &self.camera_mapping_checksum,
            ),
        };

        match (version, file) {
            (Some(version), Some(file)) => Some(ManifestEntry {
                kind,
                version_id: version.clone(),
                blob_path: file.clone(),
                checksum: checksum.clone(),
            }),
            _ => None,
        }
    }

    fn set_entry(&mut self, kind: CatalogKind, version_id: &VersionId, path: &str, checksum: String) {
        let version = Some(version_id.to_string());
        let file = Some(path.to_string());
        match kind {
            CatalogKind::ExifCorrections => {
                self.current_exif_corrections = version;
                self.exif_corrections_file = file;
                self.exif_corrections_checksum = checksum;
            }
            CatalogKind::CameraMapping => {
                self.current_camera_mapping = version;
                self.camera_mapping_file = file;
                self.camera_mapping_checksum = checksum;
            }
        }
    }
}

/// Outcome of checking a manifest entry against stored content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Stored content hashes to the advertised checksum
    Match,
    /// Stored content differs from the advertised checksum
    Mismatch,
    /// The advertised blob does not exist
    MissingBlob,
    /// The catalog has never been written
    NotRecorded,
}

/// Result of [`ManifestIndex::verify`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestCheck {
    pub kind: CatalogKind,
    pub version_id: Option<String>,
    pub blob_path: Option<String>,
    pub expected_checksum: Option<String>,
    pub actual_checksum: Option<String>,
    pub status: CheckStatus,
}

impl ManifestCheck {
    pub fn is_consistent(&self) -> bool {
        matches!(self.status, CheckStatus::Match | CheckStatus::NotRecorded)
    }
}

/// Reader and writer of the shared manifest
pub struct ManifestIndex {
    store: Arc<dyn BlobStore>,
    path: String,
    processing_version: String,
    retry: RetryPolicy,
}

impl ManifestIndex {
    pub fn new(
        store: Arc<dyn BlobStore>,
        prefix: &str,
        processing_version: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            path: manifest_path(prefix),
            processing_version: processing_version.into(),
            retry,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current manifest, or a bootstrap manifest if none has been written
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn get(&self) -> Result<ManifestRecord> {
        match self.store.get(&self.path).await? {
            Some(blob) => self.decode(&blob.body),
            None => {
                debug!("No manifest yet, returning bootstrap record");
                Ok(ManifestRecord::bootstrap(&self.processing_version))
            }
        }
    }

    /// Manifest entry for one catalog, if it has been written
    pub async fn entry(&self, kind: CatalogKind) -> Result<Option<ManifestEntry>> {
        Ok(self.get().await?.entry(kind))
    }

    /// Point `kind` at `version_id` stored at `path` with content `content`
    ///
    /// An entry that already names a newer version is left alone.
    #[instrument(skip(self, content), fields(catalog = %kind, version = %version_id))]
    pub async fn update(
        &self,
        kind: CatalogKind,
        version_id: &VersionId,
        path: &str,
        content: &[u8],
    ) -> Result<ManifestRecord> {
        let checksum = sha256_hex(content);
        let checksum = checksum.as_str();

        self.retry
            .run("manifest_update", move || {
                self.try_update(kind, version_id, path, checksum)
            })
            .await
    }

    async fn try_update(
        &self,
        kind: CatalogKind,
        version_id: &VersionId,
        path: &str,
        checksum: &str,
    ) -> Result<ManifestRecord> {
        let (mut manifest, condition) = match self.store.get(&self.path).await? {
            Some(blob) => (self.decode(&blob.body)?, WriteCondition::replacing(blob.etag)),
            None => (
                ManifestRecord::bootstrap(&self.processing_version),
                WriteCondition::IfAbsent,
            ),
        };

        if let Some(existing) = manifest.entry(kind).and_then(|e| e.parsed_version()) {
            if existing > *version_id {
                warn!(
                    current = %existing,
                    "Manifest already points at a newer version, leaving it"
                );
                return Ok(manifest);
            }
        }

        manifest.set_entry(kind, version_id, path, checksum.to_string());
        manifest.processing_version = self.processing_version.clone();
        manifest.updated_at = Some(Utc::now());

        let body = serde_json::to_vec_pretty(&manifest).map_err(|source| {
            CatalogError::Serialization {
                what: "manifest",
                source,
            }
        })?;

        self.store
            .put(&self.path, Bytes::from(body), condition)
            .await?;

        metrics::counter!("metadata.manifest.updates", "catalog" => kind.as_str()).increment(1);
        info!(path = %path, checksum = %checksum, "Manifest updated");

        Ok(manifest)
    }

    /// Recompute the checksum of the blob the manifest advertises for `kind`
    #[instrument(skip(self), fields(catalog = %kind))]
    pub async fn verify(&self, kind: CatalogKind) -> Result<ManifestCheck> {
        let Some(entry) = self.get().await?.entry(kind) else {
            return Ok(ManifestCheck {
                kind,
                version_id: None,
                blob_path: None,
                expected_checksum: None,
                actual_checksum: None,
                status: CheckStatus::NotRecorded,
            });
        };

        let actual = self
            .store
            .get(&entry.blob_path)
            .await?
            .map(|blob| sha256_hex(&blob.body));

        let status = match &actual {
            None => CheckStatus::MissingBlob,
            Some(actual) if *actual == entry.checksum => CheckStatus::Match,
            Some(_) => CheckStatus::Mismatch,
        };

        if status != CheckStatus::Match {
            warn!(
                path = %entry.blob_path,
                status = ?status,
                "Manifest entry does not match stored content"
            );
        }

        Ok(ManifestCheck {
            kind,
            version_id: Some(entry.version_id),
            blob_path: Some(entry.blob_path),
            expected_checksum: Some(entry.checksum),
            actual_checksum: actual,
            status,
        })
    }

    fn decode(&self, body: &[u8]) -> Result<ManifestRecord> {
        serde_json::from_slice(body).map_err(|source| CatalogError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{InMemoryBlobStore, MockBlobStore};
    use crate::error::BlobError;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn index(store: Arc<dyn BlobStore>) -> ManifestIndex {
        ManifestIndex::new(store, "metadata", "1.0.0", fast_retry())
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_get_bootstraps_when_missing() {
        let manifest = index(Arc::new(InMemoryBlobStore::new())).get().await.unwrap();
        assert_eq!(manifest.manifest_version, "1.0.0");
        assert!(manifest.entry(CatalogKind::ExifCorrections).is_none());
        assert!(manifest.entry(CatalogKind::CameraMapping).is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_other_catalog() {
        let store = Arc::new(InMemoryBlobStore::new());
        let index = index(store.clone());

        let v1 = VersionId::new(1735689600, 0);
        index
            .update(CatalogKind::ExifCorrections, &v1, "metadata/v1735689600/corrections.json", b"[]")
            .await
            .unwrap();
        let v2 = VersionId::new(1735689700, 0);
        index
            .update(CatalogKind::CameraMapping, &v2, "metadata/v1735689700/mapping.json", b"[1]")
            .await
            .unwrap();

        let manifest = index.get().await.unwrap();
        let exif = manifest.entry(CatalogKind::ExifCorrections).unwrap();
        assert_eq!(exif.version_id, "1735689600");
        assert_eq!(exif.checksum, sha256_hex(b"[]"));
        let mapping = manifest.entry(CatalogKind::CameraMapping).unwrap();
        assert_eq!(mapping.blob_path, "metadata/v1735689700/mapping.json");
        assert!(manifest.updated_at.is_some());

        // Persisted with the documented field names
        let raw: serde_json::Value =
            serde_json::from_slice(&store.get("metadata/manifest.json").await.unwrap().unwrap().body)
                .unwrap();
        assert_eq!(raw["current_exif_corrections"], "1735689600");
        assert_eq!(raw["camera_mapping_checksum"], sha256_hex(b"[1]"));
        assert_eq!(raw["processing_version"], "1.0.0");
    }

    #[tokio::test]
    async fn test_update_never_regresses_version() {
        let index = index(Arc::new(InMemoryBlobStore::new()));
        let newer = VersionId::new(200, 0);
        let older = VersionId::new(100, 0);

        index
            .update(CatalogKind::ExifCorrections, &newer, "metadata/v200/corrections.json", b"new")
            .await
            .unwrap();
        index
            .update(CatalogKind::ExifCorrections, &older, "metadata/v100/corrections.json", b"old")
            .await
            .unwrap();

        let entry = index.entry(CatalogKind::ExifCorrections).await.unwrap().unwrap();
        assert_eq!(entry.version_id, "200");
    }

    #[tokio::test]
    async fn test_reads_legacy_manifest() {
        let store = Arc::new(InMemoryBlobStore::new());
        let legacy = br#"{
          "manifest_version": "1.0.0",
          "created_at": "2025-01-01T00:00:00.000000+00:00",
          "current_exif_corrections": "1735689600",
          "current_camera_mapping": "1",
          "exif_corrections_file": "metadata/v1735689600/corrections.json",
          "camera_mapping_file": "metadata/current/mapping.json",
          "exif_corrections_checksum": "abc",
          "camera_mapping_checksum": "",
          "processing_version": "1.0.0",
          "rule_id": "manual_correction"
        }"#;
        store
            .put("metadata/manifest.json", Bytes::from_static(legacy), WriteCondition::Unconditional)
            .await
            .unwrap();

        let manifest = index(store).get().await.unwrap();
        assert_eq!(
            manifest.entry(CatalogKind::ExifCorrections).unwrap().parsed_version(),
            Some(VersionId::new(1735689600, 0))
        );
        assert!(manifest.updated_at.is_none());

        // Fields older tooling wrote but nothing reads are dropped on rewrite
        let rewritten = serde_json::to_value(&manifest).unwrap();
        assert!(rewritten.get("rule_id").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_an_error() {
        let store = Arc::new(InMemoryBlobStore::new());
        store
            .put("metadata/manifest.json", Bytes::from_static(b"not json"), WriteCondition::Unconditional)
            .await
            .unwrap();

        let err = index(store).get().await.unwrap_err();
        assert!(matches!(err, CatalogError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let store = Arc::new(InMemoryBlobStore::new());
        let index = index(store.clone());
        let path = "metadata/v100/corrections.json";

        assert_eq!(
            index.verify(CatalogKind::ExifCorrections).await.unwrap().status,
            CheckStatus::NotRecorded
        );

        index
            .update(CatalogKind::ExifCorrections, &VersionId::new(100, 0), path, b"[]")
            .await
            .unwrap();
        assert_eq!(
            index.verify(CatalogKind::ExifCorrections).await.unwrap().status,
            CheckStatus::MissingBlob
        );

        store
            .put(path, Bytes::from_static(b"[]"), WriteCondition::Unconditional)
            .await
            .unwrap();
        let check = index.verify(CatalogKind::ExifCorrections).await.unwrap();
        assert_eq!(check.status, CheckStatus::Match);
        assert!(check.is_consistent());

        store
            .put(path, Bytes::from_static(b"[ ]"), WriteCondition::Unconditional)
            .await
            .unwrap();
        let check = index.verify(CatalogKind::ExifCorrections).await.unwrap();
        assert_eq!(check.status, CheckStatus::Mismatch);
        assert!(!check.is_consistent());
    }

    #[tokio::test]
    async fn test_update_retries_lost_race() {
        let mut mock = MockBlobStore::new();
        mock.expect_get().returning(|_| Ok(None));

        let mut attempts = 0;
        mock.expect_put().times(2).returning(move |path, _, condition| {
            assert_eq!(condition, WriteCondition::IfAbsent);
            attempts += 1;
            if attempts == 1 {
                Err(BlobError::PreconditionFailed { path: path.to_string() })
            } else {
                Ok(Some("\"1\"".to_string()))
            }
        });

        let index = index(Arc::new(mock));
        let manifest = index
            .update(CatalogKind::CameraMapping, &VersionId::new(5, 0), "metadata/v5/mapping.json", b"[]")
            .await
            .unwrap();
        assert_eq!(manifest.current_camera_mapping.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_update_surfaces_backend_failure() {
        let mut mock = MockBlobStore::new();
        mock.expect_get()
            .times(1)
            .returning(|path| Err(BlobError::backend(path, anyhow::anyhow!("timeout"))));

        let err = index(Arc::new(mock))
            .update(CatalogKind::CameraMapping, &VersionId::new(5, 0), "metadata/v5/mapping.json", b"[]")
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));
    }
}
