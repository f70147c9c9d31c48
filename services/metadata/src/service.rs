use crate::api::AppState;
use crate::blob_store::BlobStore;
use crate::camera_mapping::CameraIdentityCatalog;
use crate::catalog::{ReconcileOutcome, VersionedTemporalCatalog};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, Result};
use crate::exif::ExifCorrectionCatalog;
use crate::manifest::ManifestIndex;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{info, warn};

/// Both catalogs and the manifest they share, opened on one blob store
#[derive(Clone)]
pub struct MetadataCatalogs {
    pub corrections: Arc<ExifCorrectionCatalog>,
    pub cameras: Arc<CameraIdentityCatalog>,
    pub manifest: Arc<ManifestIndex>,
}

impl MetadataCatalogs {
    pub fn open(store: Arc<dyn BlobStore>, config: &CatalogConfig) -> Self {
        let prefix = config.normalized_prefix();
        let retry = RetryPolicy::from_config(config);

        let manifest = Arc::new(ManifestIndex::new(
            store.clone(),
            prefix,
            config.processing_version.clone(),
            retry.clone(),
        ));

        let corrections = ExifCorrectionCatalog::new(VersionedTemporalCatalog::new(
            store.clone(),
            prefix,
            manifest.clone(),
            retry.clone(),
        ));
        let cameras = CameraIdentityCatalog::new(VersionedTemporalCatalog::new(
            store,
            prefix,
            manifest.clone(),
            retry,
        ));

        info!(prefix = %prefix, "Metadata catalogs opened");

        Self {
            corrections: Arc::new(corrections),
            cameras: Arc::new(cameras),
            manifest,
        }
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileOutcome>> {
        Ok(vec![
            self.corrections.catalog().reconcile().await?,
            self.cameras.catalog().reconcile().await?,
        ])
    }

    /// Export the current state of every non-empty catalog, returning the paths written
    pub async fn export_all(&self) -> Result<Vec<String>> {
        let mut written = Vec::new();

        for result in [
            self.corrections.catalog().write_export(None).await,
            self.cameras.catalog().write_export(None).await,
        ] {
            match result {
                Ok(path) => written.push(path),
                Err(CatalogError::Validation(reason)) => {
                    warn!(reason = %reason, "Skipping export");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            corrections: self.corrections.clone(),
            cameras: self.cameras.clone(),
            manifest: self.manifest.clone(),
        }
    }
}
