//! Camtrap Metadata Service
//!
//! Versioned, time-bounded metadata for camera-trap imagery. Two catalogs are
//! kept side by side on object storage:
//!
//! - **EXIF corrections**: per-camera clock offsets applied to image
//!   timestamps, valid over an effective interval
//! - **Camera identity**: which physical device serial sits behind a logical
//!   camera id at any instant, for device swaps
//!
//! Both are instances of one generic append-only catalog. Every write
//! produces an immutable version, replaces the current pointer, and updates
//! a shared manifest carrying the current version ids and content checksums.
//! Reads resolve the record in effect at an instant, against the current
//! state or any pinned version.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API                 Catalogs                      Blob store
//! ┌──────────────┐     ┌──────────────────────┐      ┌──────────────────┐
//! │ /corrections │────▶│ ExifCorrection       │─┐    │ {prefix}/        │
//! │ /cameras     │     │ Catalog              │ │    │   current/*.json │
//! │ /serials     │     └──────────────────────┘ ├───▶│   v{id}/*.json   │
//! │ /catalogs    │     ┌──────────────────────┐ │    │   exports/       │
//! │ /manifest    │────▶│ CameraIdentity       │─┤    │   manifest.json  │
//! └──────────────┘     │ Catalog              │ │    └──────────────────┘
//!                      └──────────────────────┘ │             ▲
//!                                               ▼             │
//!                                     ┌──────────────────┐    │
//!                                     │ ManifestIndex    │────┘
//!                                     └──────────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod camera_mapping;
pub mod catalog;
pub mod config;
pub mod error;
pub mod exif;
pub mod export;
pub mod manifest;
pub mod record;
pub mod retry;
pub mod s3_store;
pub mod service;
pub mod version;

pub use api::{start_api_server, AppState};
pub use blob_store::{BlobStore, InMemoryBlobStore, WriteCondition};
pub use camera_mapping::{CameraBinding, CameraIdentityCatalog};
pub use catalog::{ReconcileOutcome, VersionedTemporalCatalog};
pub use config::Config;
pub use error::{BlobError, CatalogError};
pub use exif::{ClockCorrection, ExifCorrectionCatalog};
pub use export::SnapshotTable;
pub use manifest::{ManifestCheck, ManifestIndex, ManifestRecord};
pub use record::{Payload, Resolved, TemporalRecord};
pub use s3_store::S3BlobStore;
pub use service::MetadataCatalogs;
pub use version::{CatalogKind, VersionDescriptor, VersionId, VersionRef};
