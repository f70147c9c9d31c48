//! Generic append-only, versioned, time-bounded catalog.
//!
//! Every write appends one record to the full record set, replaces the
//! current pointer, stores an immutable copy under a fresh version id and
//! points the manifest at that copy. Reads pick, among the records of one
//! snapshot whose interval contains the query instant, the one created last.
//!
//! Version ids are reserved through a head blob next to the current pointer
//! holding the newest reserved id and the length of the record set it was
//! reserved for. A reservation only ever moves the head to a larger id and a
//! longer record set. Pointer writes are compare-and-swap and append one
//! record each, so a longer record set always contains a shorter one, and a
//! newer version holds every record of an older one no matter which writer
//! reaches the store first.

use crate::blob_store::{BlobStore, WriteCondition};
use crate::error::{BlobError, CatalogError, Result};
use crate::export::SnapshotTable;
use crate::manifest::{sha256_hex, ManifestIndex};
use crate::record::{
    active_in, decode_snapshot, encode_snapshot, next_record_id, resolve_in, validate_new,
    Payload, Resolved, TemporalRecord,
};
use crate::retry::RetryPolicy;
use crate::version::{CatalogKind, CatalogPaths, VersionDescriptor, VersionId, VersionRef};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

type RecordSet<P> = Arc<[TemporalRecord<P>]>;

/// What [`VersionedTemporalCatalog::reconcile`] repaired
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub catalog: CatalogKind,
    /// Version created from current pointer content no version held
    pub materialized: Option<VersionId>,
    /// Newest version after reconciliation
    pub latest: Option<VersionId>,
    pub manifest_updated: bool,
}

/// Newest reserved version id and the length of its record set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct VersionHead {
    version_id: VersionId,
    record_count: usize,
}

/// Where a record set ended up after publishing
#[derive(Debug)]
enum Publication {
    /// Stored under `version_id`; `created` is false if an identical blob was there already
    Stored {
        version_id: VersionId,
        path: String,
        created: bool,
    },
    /// A longer record set was already reserved under `version_id`
    Covered { version_id: VersionId },
}

/// A version blob and its content
struct StoredVersion {
    version_id: VersionId,
    path: String,
    body: Bytes,
}

pub struct VersionedTemporalCatalog<P: Payload> {
    store: Arc<dyn BlobStore>,
    paths: CatalogPaths,
    manifest: Arc<ManifestIndex>,
    retry: RetryPolicy,
    write_lock: Mutex<()>,
    cache: RwLock<HashMap<VersionRef, RecordSet<P>>>,
    /// Bumped whenever the cache is cleared; loads that started under an
    /// older generation are not cached
    generation: AtomicU64,
}

impl<P: Payload> VersionedTemporalCatalog<P> {
    pub fn new(
        store: Arc<dyn BlobStore>,
        prefix: &str,
        manifest: Arc<ManifestIndex>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            paths: CatalogPaths::new(prefix, P::KIND),
            manifest,
            retry,
            write_lock: Mutex::new(()),
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> CatalogKind {
        P::KIND
    }

    pub fn paths(&self) -> &CatalogPaths {
        &self.paths
    }

    /// Append a record and publish a new version
    ///
    /// Returns the version holding the record. When a writer in another
    /// process appended after this one and reserved its version first, that
    /// newer version is returned instead of publishing a shorter one.
    #[instrument(skip(self, payload), fields(catalog = %P::KIND))]
    pub async fn add_record(
        &self,
        key: &str,
        payload: P,
        effective_from: DateTime<Utc>,
        effective_to: Option<DateTime<Utc>>,
        tag: &str,
    ) -> Result<VersionId> {
        validate_new(key, &payload, effective_from, effective_to, tag)?;

        let _guard = self.write_lock.lock().await;
        let payload = &payload;

        let (body, record_count) = self
            .retry
            .run("add_record", move || {
                self.replace_current(key, payload, effective_from, effective_to, tag)
            })
            .await?;

        self.clear_cache();

        let version_id = match self.publish(&body, record_count).await? {
            Publication::Stored { version_id, path, .. } => {
                self.manifest
                    .update(P::KIND, &version_id, &path, &body)
                    .await?;
                info!(version = %version_id, path = %path, "Record added");
                version_id
            }
            Publication::Covered { version_id } => {
                info!(version = %version_id, "Record added, published by a later write");
                version_id
            }
        };

        metrics::counter!("metadata.catalog.writes", "catalog" => P::KIND.as_str()).increment(1);

        Ok(version_id)
    }

    /// Append to the current pointer with a compare-and-swap write
    ///
    /// Returns the new pointer content and its record count.
    async fn replace_current(
        &self,
        key: &str,
        payload: &P,
        effective_from: DateTime<Utc>,
        effective_to: Option<DateTime<Utc>>,
        tag: &str,
    ) -> Result<(Bytes, usize)> {
        let current_path = self.paths.current();

        let (mut records, condition) = match self.store.get(&current_path).await? {
            Some(blob) => (
                decode_snapshot::<P>(&current_path, &blob.body)?,
                WriteCondition::replacing(blob.etag),
            ),
            None => (Vec::new(), WriteCondition::IfAbsent),
        };

        let record = TemporalRecord {
            record_id: next_record_id(P::KIND, key, effective_from, &records),
            key: key.to_string(),
            payload: payload.clone(),
            effective_from,
            effective_to,
            tag: tag.to_string(),
            created_at: Utc::now(),
        };

        if let Some(existing) = records
            .iter()
            .find(|r| r.key == record.key && r.overlaps(&record))
        {
            warn!(
                existing = %existing.record_id,
                new = %record.record_id,
                "New interval overlaps an existing record, latest created_at wins"
            );
        }

        records.push(record);
        let body = Bytes::from(encode_snapshot(&records)?);

        self.store
            .put(&current_path, body.clone(), condition)
            .await?;

        Ok((body, records.len()))
    }

    /// Store a record set of `record_count` records under a reserved id
    async fn publish(&self, body: &Bytes, record_count: usize) -> Result<Publication> {
        let head = self
            .retry
            .run("reserve_version", move || self.reserve_version(record_count))
            .await?;

        if head.record_count > record_count {
            debug!(
                version = %head.version_id,
                reserved_for = head.record_count,
                record_count,
                "Longer record set already reserved"
            );
            return Ok(Publication::Covered {
                version_id: head.version_id,
            });
        }

        let path = self.paths.version(&head.version_id);
        let created = self.store_version(&path, body).await?;

        Ok(Publication::Stored {
            version_id: head.version_id,
            path,
            created,
        })
    }

    /// Move the head to a fresh id for `record_count` records
    ///
    /// Leaves the head alone and returns it when it already covers at least
    /// that many records.
    async fn reserve_version(&self, record_count: usize) -> Result<VersionHead> {
        let (head, condition) = self.load_head().await?;

        if let Some(head) = head.filter(|h| h.record_count >= record_count) {
            return Ok(head);
        }

        let reserved = VersionHead {
            version_id: VersionId::next_after(head.map(|h| h.version_id), Utc::now()),
            record_count,
        };
        let body = serde_json::to_vec(&reserved).map_err(|source| CatalogError::Serialization {
            what: "version head",
            source,
        })?;

        self.store
            .put(&self.paths.head(), Bytes::from(body), condition)
            .await?;

        debug!(version = %reserved.version_id, record_count, "Version reserved");
        Ok(reserved)
    }

    /// Read the head with the condition for replacing it
    async fn load_head(&self) -> Result<(Option<VersionHead>, WriteCondition)> {
        let path = self.paths.head();

        match self.store.get(&path).await? {
            Some(blob) => {
                let head = serde_json::from_slice(&blob.body)
                    .map_err(|source| CatalogError::Corrupt { path, source })?;
                Ok((Some(head), WriteCondition::replacing(blob.etag)))
            }
            None => Ok((self.seed_head().await?, WriteCondition::IfAbsent)),
        }
    }

    /// Head implied by the newest listed version, for stores written
    /// before heads existed
    async fn seed_head(&self) -> Result<Option<VersionHead>> {
        let Some(newest) = self.list_versions().await?.into_iter().next() else {
            return Ok(None);
        };

        let record_count = match self.store.get(&newest.path).await? {
            Some(blob) => decode_snapshot::<P>(&newest.path, &blob.body)?.len(),
            None => 0,
        };

        debug!(version = %newest.version_id, record_count, "Seeding head from listed versions");
        Ok(Some(VersionHead {
            version_id: newest.version_id,
            record_count,
        }))
    }

    /// Create-only write of a version blob, true if this call created it
    async fn store_version(&self, path: &str, body: &Bytes) -> Result<bool> {
        match self
            .store
            .put(path, body.clone(), WriteCondition::IfAbsent)
            .await
        {
            Ok(_) => Ok(true),
            Err(BlobError::PreconditionFailed { .. }) => match self.store.get(path).await? {
                Some(existing) if existing.body == *body => Ok(false),
                _ => {
                    warn!(path = %path, "Reserved version already holds different content");
                    Err(CatalogError::WriteConflict {
                        path: path.to_string(),
                    })
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Full record set of a version, or of the current pointer
    pub async fn records(&self, version: Option<VersionId>) -> Result<RecordSet<P>> {
        let version_ref = VersionRef::from(version);

        let cached = self.cache.read().get(&version_ref).cloned();
        if let Some(hit) = cached {
            metrics::counter!("metadata.catalog.cache_hits", "catalog" => P::KIND.as_str())
                .increment(1);
            return Ok(hit);
        }
        metrics::counter!("metadata.catalog.cache_misses", "catalog" => P::KIND.as_str())
            .increment(1);

        let generation = self.generation.load(Ordering::SeqCst);
        let path = self.paths.for_ref(version_ref);

        let records: RecordSet<P> = match self.store.get(&path).await? {
            Some(blob) => decode_snapshot::<P>(&path, &blob.body)?.into(),
            None => {
                warn!(path = %path, version = %version_ref, "Catalog blob not found, treating as empty");
                Vec::new().into()
            }
        };

        if !records.is_empty() {
            let mut cache = self.cache.write();
            if self.generation.load(Ordering::SeqCst) == generation {
                cache.insert(version_ref, records.clone());
            }
        }

        Ok(records)
    }

    /// Record for `key` in effect at `at`
    pub async fn resolve(
        &self,
        key: &str,
        at: DateTime<Utc>,
        version: Option<VersionId>,
    ) -> Result<Option<Resolved<P>>> {
        self.resolve_by(key, at, version, |r| r.key.as_str()).await
    }

    /// Like [`resolve`](Self::resolve), matching `lookup` against `key_fn`
    pub async fn resolve_by<F>(
        &self,
        lookup: &str,
        at: DateTime<Utc>,
        version: Option<VersionId>,
        key_fn: F,
    ) -> Result<Option<Resolved<P>>>
    where
        F: Fn(&TemporalRecord<P>) -> &str,
    {
        let records = self.records(version).await?;

        Ok(
            resolve_in(&records, lookup, at, key_fn).map(|record| Resolved {
                record: record.clone(),
                source: VersionRef::from(version),
            }),
        )
    }

    /// One record per key in effect at `at` (default now), ordered by key
    pub async fn list_active(
        &self,
        at: Option<DateTime<Utc>>,
        version: Option<VersionId>,
    ) -> Result<Vec<Resolved<P>>> {
        let at = at.unwrap_or_else(Utc::now);
        let records = self.records(version).await?;

        Ok(active_in(&records, at)
            .into_iter()
            .map(|record| Resolved {
                record: record.clone(),
                source: VersionRef::from(version),
            })
            .collect())
    }

    /// Stored versions, newest first
    #[instrument(skip(self), fields(catalog = %P::KIND))]
    pub async fn list_versions(&self) -> Result<Vec<VersionDescriptor>> {
        let mut versions: Vec<VersionDescriptor> = self
            .store
            .list(&self.paths.versions_prefix())
            .await?
            .into_iter()
            .filter_map(|object| {
                let version_id = self.paths.parse_version_path(&object.path)?;
                Some(VersionDescriptor {
                    version_id,
                    path: object.path,
                    last_modified: object.last_modified,
                    size_bytes: object.size_bytes,
                })
            })
            .collect();

        versions.sort_by(|a, b| b.version_id.cmp(&a.version_id));
        Ok(versions)
    }

    pub async fn export_snapshot(&self, version: Option<VersionId>) -> Result<SnapshotTable> {
        let records = self.records(version).await?;
        Ok(SnapshotTable::from_records(version.as_ref(), &records))
    }

    /// Export a snapshot to the exports area, returning its path
    #[instrument(skip(self), fields(catalog = %P::KIND))]
    pub async fn write_export(&self, version: Option<VersionId>) -> Result<String> {
        let table = self.export_snapshot(version).await?;
        if table.is_empty() {
            return Err(CatalogError::Validation(format!(
                "no {} to export",
                P::KIND.export_name()
            )));
        }

        let path = self.paths.export(version.as_ref());
        self.store
            .put(&path, Bytes::from(table.to_parquet()?), WriteCondition::Unconditional)
            .await?;

        info!(path = %path, rows = table.num_rows(), "Snapshot exported");
        Ok(path)
    }

    /// Repair what an interrupted write left behind
    ///
    /// Content in the current pointer that no version holds is stored as a
    /// new version, a reserved version whose blob never landed is written,
    /// and the manifest is pointed at the newest version.
    #[instrument(skip(self), fields(catalog = %P::KIND))]
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let _guard = self.write_lock.lock().await;

        let current_path = self.paths.current();
        let mut materialized = None;

        if let Some(current) = self.store.get(&current_path).await? {
            // Refuse to publish a pointer nobody can read
            let record_count = decode_snapshot::<P>(&current_path, &current.body)?.len();

            if let Publication::Stored {
                version_id,
                created: true,
                ..
            } = self.publish(&current.body, record_count).await?
            {
                warn!(version = %version_id, "Current pointer ahead of stored versions, materialized");
                materialized = Some(version_id);
                self.clear_cache();
            }
        }

        let latest = self.head_version().await?;

        let mut manifest_updated = false;
        if let Some(latest) = &latest {
            let checksum = sha256_hex(&latest.body);
            let in_sync = self.manifest.entry(P::KIND).await?.map_or(false, |entry| {
                entry.parsed_version() == Some(latest.version_id)
                    && entry.blob_path == latest.path
                    && entry.checksum == checksum
            });

            if !in_sync {
                self.manifest
                    .update(P::KIND, &latest.version_id, &latest.path, &latest.body)
                    .await?;
                manifest_updated = true;
            }
        }

        let outcome = ReconcileOutcome {
            catalog: P::KIND,
            materialized,
            latest: latest.map(|l| l.version_id),
            manifest_updated,
        };
        info!(?outcome, "Catalog reconciled");
        Ok(outcome)
    }

    /// The version the head points at, if its blob exists
    async fn head_version(&self) -> Result<Option<StoredVersion>> {
        let Some(head) = self.load_head().await?.0 else {
            return Ok(None);
        };

        let path = self.paths.version(&head.version_id);
        Ok(self.store.get(&path).await?.map(|blob| StoredVersion {
            version_id: head.version_id,
            path,
            body: blob.body,
        }))
    }

    fn clear_cache(&self) {
        let mut cache = self.cache.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobObject, InMemoryBlobStore, MockBlobStore, ObjectSummary};
    use crate::record::test_support::{record, ts, Delta};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn catalog_on(store: Arc<dyn BlobStore>) -> VersionedTemporalCatalog<Delta> {
        catalog_with(store, fast_retry())
    }

    fn catalog_with(store: Arc<dyn BlobStore>, retry: RetryPolicy) -> VersionedTemporalCatalog<Delta> {
        let manifest = Arc::new(ManifestIndex::new(store.clone(), "metadata", "1.0.0", retry.clone()));
        VersionedTemporalCatalog::new(store, "metadata", manifest, retry)
    }

    fn setup() -> (Arc<InMemoryBlobStore>, VersionedTemporalCatalog<Delta>) {
        let store = Arc::new(InMemoryBlobStore::new());
        let catalog = catalog_on(store.clone());
        (store, catalog)
    }

    async fn add(catalog: &VersionedTemporalCatalog<Delta>, key: &str, delta: i64, from: &str, to: Option<&str>) -> VersionId {
        catalog
            .add_record(key, Delta { delta_seconds: delta }, ts(from), to.map(ts), "manual")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_catalog_resolves_nothing() {
        let (_, catalog) = setup();
        let hit = catalog.resolve("cam1", ts("2025-01-01T00:00:00Z"), None).await.unwrap();
        assert!(hit.is_none());
        assert!(catalog.list_versions().await.unwrap().is_empty());
        assert!(catalog.list_active(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_then_resolve() {
        let (store, catalog) = setup();
        let version = add(&catalog, "cam1", 3600, "2025-01-01T00:00:00Z", None).await;

        let hit = catalog
            .resolve("cam1", ts("2025-06-01T12:00:00Z"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.payload().delta_seconds, 3600);
        assert_eq!(hit.record.record_id, "correction_cam1_1735689600");
        assert_eq!(hit.source, VersionRef::Current);

        let pinned = catalog
            .resolve("cam1", ts("2025-06-01T12:00:00Z"), Some(version))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.source, VersionRef::Pinned(version));

        assert!(store.paths().contains(&"metadata/current/corrections.json".to_string()));
        assert!(store.paths().contains(&format!("metadata/v{version}/corrections.json")));
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let (_, catalog) = setup();
        add(&catalog, "cam1", 10, "2025-01-01T00:00:00Z", None).await;

        let at = ts("2025-03-01T00:00:00Z");
        let first = catalog.resolve("cam1", at, None).await.unwrap();
        let second = catalog.resolve("cam1", at, None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_history_is_append_only() {
        let (_, catalog) = setup();
        let v1 = add(&catalog, "cam1", 1, "2025-01-01T00:00:00Z", None).await;
        let v2 = add(&catalog, "cam2", 2, "2025-01-01T00:00:00Z", None).await;
        let v3 = add(&catalog, "cam1", 3, "2025-02-01T00:00:00Z", None).await;
        assert!(v1 < v2 && v2 < v3);

        let older = catalog.records(Some(v1)).await.unwrap();
        let newer = catalog.records(Some(v3)).await.unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(newer.len(), 3);
        for record in older.iter() {
            assert!(newer.contains(record));
        }

        // Pinned reads stay on their snapshot
        let pinned = catalog
            .resolve("cam1", ts("2025-06-01T00:00:00Z"), Some(v1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.payload().delta_seconds, 1);
    }

    #[tokio::test]
    async fn test_later_record_wins_overlap() {
        let (_, catalog) = setup();
        add(&catalog, "cam1", 10, "2025-01-01T00:00:00Z", None).await;
        add(&catalog, "cam1", 20, "2025-03-01T00:00:00Z", Some("2025-04-01T00:00:00Z")).await;

        let covered_by_both = catalog.resolve("cam1", ts("2025-03-15T00:00:00Z"), None).await.unwrap();
        assert_eq!(covered_by_both.unwrap().payload().delta_seconds, 20);

        let only_first = catalog.resolve("cam1", ts("2025-05-01T00:00:00Z"), None).await.unwrap();
        assert_eq!(only_first.unwrap().payload().delta_seconds, 10);
    }

    #[tokio::test]
    async fn test_list_versions_newest_first() {
        let (_, catalog) = setup();
        let mut written = Vec::new();
        for key in ["cam1", "cam2", "cam3"] {
            written.push(add(&catalog, key, 1, "2025-01-01T00:00:00Z", None).await);
        }

        let versions = catalog.list_versions().await.unwrap();
        assert_eq!(versions.len(), 3);
        written.reverse();
        let listed: Vec<VersionId> = versions.iter().map(|v| v.version_id).collect();
        assert_eq!(listed, written);
        assert!(versions.iter().all(|v| v.size_bytes > 0 && v.last_modified.is_some()));
    }

    #[tokio::test]
    async fn test_rapid_writes_get_distinct_versions() {
        let (store, catalog) = setup();
        for i in 0..5 {
            add(&catalog, &format!("cam{i}"), i, "2025-01-01T00:00:00Z", None).await;
        }

        let versions = catalog.list_versions().await.unwrap();
        assert_eq!(versions.len(), 5);
        // Every version holds one more record than the one before it
        for (i, descriptor) in versions.iter().rev().enumerate() {
            let records = catalog.records(Some(descriptor.version_id)).await.unwrap();
            assert_eq!(records.len(), i + 1);
        }
        // Versions plus the current pointer, its head and the manifest
        assert_eq!(store.len(), 5 + 3);
    }

    #[tokio::test]
    async fn test_manifest_checksum_matches_stored_version() {
        let (store, catalog) = setup();
        add(&catalog, "cam1", 1, "2025-01-01T00:00:00Z", None).await;
        let version = add(&catalog, "cam2", 2, "2025-01-01T00:00:00Z", None).await;

        let manifest = catalog.manifest.get().await.unwrap();
        let entry = manifest.entry(CatalogKind::ExifCorrections).unwrap();
        assert_eq!(entry.parsed_version(), Some(version));

        let stored = store.get(&entry.blob_path).await.unwrap().unwrap();
        assert_eq!(entry.checksum, sha256_hex(&stored.body));
        assert!(manifest.entry(CatalogKind::CameraMapping).is_none());
    }

    #[tokio::test]
    async fn test_validation_writes_nothing() {
        let (store, catalog) = setup();
        let err = catalog
            .add_record(
                "cam1",
                Delta { delta_seconds: 1 },
                ts("2025-02-01T00:00:00Z"),
                Some(ts("2025-01-01T00:00:00Z")),
                "manual",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CatalogError::Validation(_)));
        assert!(store.is_empty());
    }

    /// Every record of an older version is in each newer one
    async fn assert_monotonic_history(catalog: &VersionedTemporalCatalog<Delta>) {
        let mut versions = catalog.list_versions().await.unwrap();
        versions.reverse();

        for pair in versions.windows(2) {
            let older = catalog.records(Some(pair[0].version_id)).await.unwrap();
            let newer = catalog.records(Some(pair[1].version_id)).await.unwrap();
            for record in older.iter() {
                assert!(
                    newer.contains(record),
                    "{} in {} missing from newer {}",
                    record.key,
                    pair[0].version_id,
                    pair[1].version_id
                );
            }
        }
    }

    /// Keys held by the version the manifest points at
    async fn manifest_keys(catalog: &VersionedTemporalCatalog<Delta>) -> (VersionId, Vec<String>) {
        let entry = catalog
            .manifest
            .entry(CatalogKind::ExifCorrections)
            .await
            .unwrap()
            .unwrap();
        let version = entry.parsed_version().unwrap();

        let mut keys: Vec<String> = catalog
            .records(Some(version))
            .await
            .unwrap()
            .iter()
            .map(|r| r.key.clone())
            .collect();
        keys.sort();
        (version, keys)
    }

    /// Store that stalls the first successful write to a path ending in
    /// `suffix` until released
    struct GatedStore {
        inner: Arc<InMemoryBlobStore>,
        suffix: &'static str,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn new(inner: Arc<InMemoryBlobStore>, suffix: &'static str) -> Self {
            Self {
                inner,
                suffix,
                armed: AtomicBool::new(true),
                reached: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl BlobStore for GatedStore {
        async fn get(&self, path: &str) -> std::result::Result<Option<BlobObject>, BlobError> {
            self.inner.get(path).await
        }

        async fn put(
            &self,
            path: &str,
            body: Bytes,
            condition: WriteCondition,
        ) -> std::result::Result<Option<String>, BlobError> {
            let etag = self.inner.put(path, body, condition).await?;
            if path.ends_with(self.suffix) && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            Ok(etag)
        }

        async fn exists(&self, path: &str) -> std::result::Result<bool, BlobError> {
            self.inner.exists(path).await
        }

        async fn list(&self, prefix: &str) -> std::result::Result<Vec<ObjectSummary>, BlobError> {
            self.inner.list(prefix).await
        }
    }

    /// Writer A stalls at `gate` while writer B, in another process, completes
    async fn interleave(gate: &'static str) -> (VersionId, VersionId, VersionedTemporalCatalog<Delta>) {
        let store = Arc::new(InMemoryBlobStore::new());
        let gated = Arc::new(GatedStore::new(store.clone(), gate));
        let a = Arc::new(catalog_on(gated.clone()));
        let b = catalog_on(store);

        let writer_a = tokio::spawn({
            let a = a.clone();
            async move {
                a.add_record("camA", Delta { delta_seconds: 1 }, ts("2025-01-01T00:00:00Z"), None, "manual")
                    .await
            }
        });

        gated.reached.notified().await;
        let vb = add(&b, "camB", 2, "2025-01-01T00:00:00Z", None).await;
        gated.release.notify_one();
        let va = writer_a.await.unwrap().unwrap();

        (va, vb, b)
    }

    #[tokio::test]
    async fn test_writer_stalled_after_pointer_swap_reports_newer_version() {
        let (va, vb, catalog) = interleave("current/corrections.json").await;

        // B reserved first with a record set holding A's record too
        assert_eq!(va, vb);
        assert_eq!(catalog.list_versions().await.unwrap().len(), 1);
        assert_monotonic_history(&catalog).await;

        let (manifest_version, keys) = manifest_keys(&catalog).await;
        assert_eq!(manifest_version, vb);
        assert_eq!(keys, vec!["camA", "camB"]);
    }

    #[tokio::test]
    async fn test_writer_stalled_after_reservation_stays_older() {
        let (va, vb, catalog) = interleave("current/corrections.head.json").await;

        assert!(va < vb);
        assert_eq!(catalog.list_versions().await.unwrap().len(), 2);
        assert_eq!(catalog.records(Some(va)).await.unwrap().len(), 1);
        assert_monotonic_history(&catalog).await;

        // A's late manifest update must not move the manifest back
        let (manifest_version, keys) = manifest_keys(&catalog).await;
        assert_eq!(manifest_version, vb);
        assert_eq!(keys, vec!["camA", "camB"]);
    }

    #[tokio::test]
    async fn test_concurrent_writers_lose_nothing() {
        let patient = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let store = Arc::new(InMemoryBlobStore::new());
        // Separate instances share no write lock, only the store
        let a = Arc::new(catalog_with(store.clone(), patient.clone()));
        let b = Arc::new(catalog_with(store.clone(), patient));

        let mut handles = Vec::new();
        for i in 0..4 {
            for catalog in [a.clone(), b.clone()] {
                let key = format!("cam{i}-{}", handles.len());
                handles.push(tokio::spawn(async move {
                    catalog
                        .add_record(&key, Delta { delta_seconds: i }, ts("2025-01-01T00:00:00Z"), None, "manual")
                        .await
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Every write is in the current set exactly once
        let records = a.records(None).await.unwrap();
        let mut current: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        current.sort();
        current.dedup();
        assert_eq!(current.len(), 8);
        assert_eq!(records.len(), 8);

        assert_monotonic_history(&a).await;
        let (_, keys) = manifest_keys(&a).await;
        assert_eq!(keys, current);
    }

    #[tokio::test]
    async fn test_legacy_versions_without_head_stay_ordered() {
        let (store, catalog) = setup();
        let legacy = VersionId::new(Utc::now().timestamp() + 3600, 0);
        let body = Bytes::from(
            encode_snapshot(&[record("cam1", 1, "2025-01-01T00:00:00Z", None, "2025-01-01T00:00:00Z")]).unwrap(),
        );
        for path in [catalog.paths.version(&legacy), catalog.paths.current()] {
            store.put(&path, body.clone(), WriteCondition::Unconditional).await.unwrap();
        }

        let version = add(&catalog, "cam2", 2, "2025-01-01T00:00:00Z", None).await;
        assert!(version > legacy);
        assert_eq!(catalog.records(Some(version)).await.unwrap().len(), 2);
        assert!(store.exists(&catalog.paths.head()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_cleared_on_write() {
        let (_, catalog) = setup();
        add(&catalog, "cam1", 1, "2025-01-01T00:00:00Z", None).await;
        assert_eq!(catalog.records(None).await.unwrap().len(), 1);

        add(&catalog, "cam2", 2, "2025-01-01T00:00:00Z", None).await;
        assert_eq!(catalog.records(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_current_is_an_error() {
        let (store, catalog) = setup();
        store
            .put("metadata/current/corrections.json", Bytes::from_static(b"{oops"), WriteCondition::Unconditional)
            .await
            .unwrap();

        let err = catalog.resolve("cam1", Utc::now(), None).await.unwrap_err();
        assert!(matches!(err, CatalogError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_export() {
        let (store, catalog) = setup();

        let err = catalog.write_export(None).await.unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));

        let version = add(&catalog, "cam1", 60, "2025-01-01T00:00:00Z", None).await;
        let table = catalog.export_snapshot(Some(version)).await.unwrap();
        assert_eq!(table.num_rows(), 1);

        let path = catalog.write_export(Some(version)).await.unwrap();
        assert_eq!(path, format!("metadata/exports/corrections_v{version}.parquet"));
        let written = store.get(&path).await.unwrap().unwrap();
        assert!(written.body.starts_with(b"PAR1"));
        assert!(store.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_after_crash_before_version_write() {
        let (store, catalog) = setup();
        let v1 = add(&catalog, "cam1", 1, "2025-01-01T00:00:00Z", None).await;

        // Simulate a writer that replaced the current pointer and died
        let mut records = catalog.records(None).await.unwrap().to_vec();
        let mut extra = records[0].clone();
        extra.key = "cam2".to_string();
        extra.record_id = "correction_cam2_1735689600".to_string();
        records.push(extra);
        store
            .put(
                "metadata/current/corrections.json",
                Bytes::from(encode_snapshot(&records).unwrap()),
                WriteCondition::Unconditional,
            )
            .await
            .unwrap();

        let outcome = catalog.reconcile().await.unwrap();
        let materialized = outcome.materialized.unwrap();
        assert!(materialized > v1);
        assert!(outcome.manifest_updated);
        assert_eq!(outcome.latest, Some(materialized));

        assert_eq!(catalog.records(Some(materialized)).await.unwrap().len(), 2);
        let check = catalog.manifest.verify(CatalogKind::ExifCorrections).await.unwrap();
        assert!(check.is_consistent());

        // Nothing left to repair
        let again = catalog.reconcile().await.unwrap();
        assert_eq!(again.materialized, None);
        assert!(!again.manifest_updated);
    }

    #[tokio::test]
    async fn test_reconcile_writes_reserved_version_that_never_landed() {
        let (store, catalog) = setup();
        add(&catalog, "cam1", 1, "2025-01-01T00:00:00Z", None).await;
        let version = add(&catalog, "cam2", 2, "2025-01-01T00:00:00Z", None).await;

        // Head moved, then the writer died before storing the blob
        store.remove(&catalog.paths.version(&version));

        let outcome = catalog.reconcile().await.unwrap();
        assert_eq!(outcome.materialized, Some(version));
        assert_eq!(outcome.latest, Some(version));
        assert_eq!(catalog.records(Some(version)).await.unwrap().len(), 2);
        assert!(catalog.manifest.verify(CatalogKind::ExifCorrections).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_reconcile_repairs_stale_manifest() {
        let (store, catalog) = setup();
        add(&catalog, "cam1", 1, "2025-01-01T00:00:00Z", None).await;
        store.remove("metadata/manifest.json");

        let outcome = catalog.reconcile().await.unwrap();
        assert_eq!(outcome.materialized, None);
        assert!(outcome.manifest_updated);
        assert!(catalog.manifest.entry(CatalogKind::ExifCorrections).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflict_on_current_is_retried() {
        let mut mock = MockBlobStore::new();
        mock.expect_get().returning(|_| Ok(None));
        mock.expect_list().returning(|_| Ok(Vec::new()));

        let mut current_attempts = 0;
        mock.expect_put().returning(move |path, _, condition| {
            if path.ends_with("current/corrections.json") {
                assert_eq!(condition, WriteCondition::IfAbsent);
                current_attempts += 1;
                if current_attempts == 1 {
                    return Err(BlobError::PreconditionFailed { path: path.to_string() });
                }
            }
            Ok(Some("\"1\"".to_string()))
        });

        let catalog = catalog_on(Arc::new(mock));
        let version = catalog
            .add_record("cam1", Delta { delta_seconds: 1 }, ts("2025-01-01T00:00:00Z"), None, "manual")
            .await;
        assert!(version.is_ok());
    }

    #[tokio::test]
    async fn test_backend_failure_is_surfaced() {
        let mut mock = MockBlobStore::new();
        mock.expect_get()
            .returning(|path| Err(BlobError::backend(path, anyhow::anyhow!("503 Slow Down"))));

        let catalog = catalog_on(Arc::new(mock));
        let err = catalog.records(None).await.unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
