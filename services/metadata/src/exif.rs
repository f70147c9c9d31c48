//! Per-camera clock corrections applied to EXIF timestamps.

use crate::catalog::VersionedTemporalCatalog;
use crate::error::{CatalogError, Result};
use crate::export::{Cell, ColumnType, SnapshotTable};
use crate::record::{Payload, Resolved};
use crate::version::{CatalogKind, VersionDescriptor, VersionId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_RULE_ID: &str = "manual_correction";

/// Signed offset added to a camera's EXIF timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockCorrection {
    pub delta_seconds: i64,
}

impl Payload for ClockCorrection {
    const KIND: CatalogKind = CatalogKind::ExifCorrections;
    const COLUMNS: &'static [(&'static str, ColumnType)] = &[("delta_seconds", ColumnType::Int64)];

    fn column_values(&self) -> Vec<Cell> {
        vec![Cell::Int64(Some(self.delta_seconds))]
    }
}

pub struct ExifCorrectionCatalog {
    inner: VersionedTemporalCatalog<ClockCorrection>,
}

impl ExifCorrectionCatalog {
    pub fn new(inner: VersionedTemporalCatalog<ClockCorrection>) -> Self {
        Self { inner }
    }

    /// Underlying generic catalog
    pub fn catalog(&self) -> &VersionedTemporalCatalog<ClockCorrection> {
        &self.inner
    }

    /// Record a correction; `rule_id` defaults to [`DEFAULT_RULE_ID`]
    pub async fn add_correction(
        &self,
        camera_id: &str,
        delta_seconds: i64,
        effective_from: DateTime<Utc>,
        effective_to: Option<DateTime<Utc>>,
        rule_id: Option<&str>,
    ) -> Result<VersionId> {
        self.inner
            .add_record(
                camera_id,
                ClockCorrection { delta_seconds },
                effective_from,
                effective_to,
                rule_id.unwrap_or(DEFAULT_RULE_ID),
            )
            .await
    }

    pub async fn get_correction(
        &self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        version: Option<VersionId>,
    ) -> Result<Option<Resolved<ClockCorrection>>> {
        self.inner.resolve(camera_id, timestamp, version).await
    }

    /// Corrected timestamp and the correction used, if any
    ///
    /// Without a matching correction the timestamp comes back unchanged.
    pub async fn apply_correction(
        &self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        version: Option<VersionId>,
    ) -> Result<(DateTime<Utc>, Option<Resolved<ClockCorrection>>)> {
        let Some(correction) = self.get_correction(camera_id, timestamp, version).await? else {
            debug!(camera_id, "No correction in effect");
            return Ok((timestamp, None));
        };

        let delta = correction.payload().delta_seconds;
        let corrected = Duration::try_seconds(delta)
            .and_then(|d| timestamp.checked_add_signed(d))
            .ok_or_else(|| {
                CatalogError::Validation(format!(
                    "correction of {delta}s for {camera_id} overflows {}",
                    timestamp.to_rfc3339()
                ))
            })?;

        Ok((corrected, Some(correction)))
    }

    pub async fn list_active(
        &self,
        timestamp: Option<DateTime<Utc>>,
        version: Option<VersionId>,
    ) -> Result<Vec<Resolved<ClockCorrection>>> {
        self.inner.list_active(timestamp, version).await
    }

    pub async fn list_versions(&self) -> Result<Vec<VersionDescriptor>> {
        self.inner.list_versions().await
    }

    pub async fn export_snapshot(&self, version: Option<VersionId>) -> Result<SnapshotTable> {
        self.inner.export_snapshot(version).await
    }
}
