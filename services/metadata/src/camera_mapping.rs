//! Logical camera id to physical device serial bindings.
//!
//! A logical camera id stays stable for a deployment site while the device
//! behind it gets swapped; lookups work in both directions at any instant.

use crate::catalog::VersionedTemporalCatalog;
use crate::error::Result;
use crate::export::{Cell, ColumnType, SnapshotTable};
use crate::record::{Payload, Resolved};
use crate::version::{CatalogKind, VersionDescriptor, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAP_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraBinding {
    pub physical_serial: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Payload for CameraBinding {
    const KIND: CatalogKind = CatalogKind::CameraMapping;
    const COLUMNS: &'static [(&'static str, ColumnType)] =
        &[("physical_serial", ColumnType::Utf8), ("alias", ColumnType::Utf8)];

    fn column_values(&self) -> Vec<Cell> {
        vec![Cell::Utf8(Some(self.physical_serial.clone())), Cell::Utf8(self.alias.clone())]
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.physical_serial.trim().is_empty() {
            return Err("physical_serial must not be empty".to_string());
        }
        Ok(())
    }
}

pub struct CameraIdentityCatalog {
    inner: VersionedTemporalCatalog<CameraBinding>,
}

impl CameraIdentityCatalog {
    pub fn new(inner: VersionedTemporalCatalog<CameraBinding>) -> Self {
        Self { inner }
    }

    pub fn catalog(&self) -> &VersionedTemporalCatalog<CameraBinding> {
        &self.inner
    }

    /// Bind `camera_id` to `physical_serial`
    ///
    /// `effective_from` defaults to now and `map_version` to
    /// [`DEFAULT_MAP_VERSION`].
    pub async fn add_mapping(
        &self,
        camera_id: &str,
        physical_serial: &str,
        alias: Option<String>,
        effective_from: Option<DateTime<Utc>>,
        effective_to: Option<DateTime<Utc>>,
        map_version: Option<&str>,
    ) -> Result<VersionId> {
        let binding = CameraBinding {
            physical_serial: physical_serial.to_string(),
            alias,
        };

        self.inner
            .add_record(
                camera_id,
                binding,
                effective_from.unwrap_or_else(Utc::now),
                effective_to,
                map_version.unwrap_or(DEFAULT_MAP_VERSION),
            )
            .await
    }

    /// Logical camera id bound to `physical_serial` at `timestamp`
    pub async fn get_camera_id(
        &self,
        physical_serial: &str,
        timestamp: DateTime<Utc>,
        version: Option<VersionId>,
    ) -> Result<Option<String>> {
        let hit = self
            .inner
            .resolve_by(physical_serial, timestamp, version, |r| {
                r.payload.physical_serial.as_str()
            })
            .await?;

        Ok(hit.map(|r| r.record.key))
    }

    /// Physical serial behind `camera_id` at `timestamp`
    pub async fn get_physical_serial(
        &self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        version: Option<VersionId>,
    ) -> Result<Option<String>> {
        Ok(self
            .get_mapping_info(camera_id, timestamp, version)
            .await?
            .map(|r| r.record.payload.physical_serial))
    }

    /// Full binding of `camera_id` at `timestamp`
    pub async fn get_mapping_info(
        &self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        version: Option<VersionId>,
    ) -> Result<Option<Resolved<CameraBinding>>> {
        self.inner.resolve(camera_id, timestamp, version).await
    }

    pub async fn list_active(
        &self,
        timestamp: Option<DateTime<Utc>>,
        version: Option<VersionId>,
    ) -> Result<Vec<Resolved<CameraBinding>>> {
        self.inner.list_active(timestamp, version).await
    }

    pub async fn list_versions(&self) -> Result<Vec<VersionDescriptor>> {
        self.inner.list_versions().await
    }

    pub async fn export_snapshot(&self, version: Option<VersionId>) -> Result<SnapshotTable> {
        self.inner.export_snapshot(version).await
    }
}
