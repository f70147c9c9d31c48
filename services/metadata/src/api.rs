use crate::camera_mapping::{CameraBinding, CameraIdentityCatalog};
use crate::config::ApiConfig;
use crate::error::CatalogError;
use crate::exif::{ClockCorrection, ExifCorrectionCatalog};
use crate::export::SnapshotTable;
use crate::manifest::{ManifestCheck, ManifestIndex, ManifestRecord};
use crate::record::{parse_instant, Resolved};
use crate::version::{CatalogKind, VersionDescriptor, VersionId};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub corrections: Arc<ExifCorrectionCatalog>,
    pub cameras: Arc<CameraIdentityCatalog>,
    pub manifest: Arc<ManifestIndex>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

impl From<CatalogError> for ErrorResponse {
    fn from(e: CatalogError) -> Self {
        Self {
            code: e.code().to_string(),
            error: e.to_string(),
        }
    }
}

fn catalog_error(e: CatalogError) -> ApiError {
    let status = match &e {
        CatalogError::Validation(_) => StatusCode::BAD_REQUEST,
        CatalogError::WriteConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(error = %e, "Catalog operation failed");
    } else {
        warn!(error = %e, "Catalog request rejected");
    }

    (status, Json(e.into()))
}

fn not_found(what: String) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: what,
            code: "NOT_FOUND".to_string(),
        }),
    )
}

/// Point-in-time lookup parameters
#[derive(Debug, Default, Deserialize)]
pub struct LookupQuery {
    /// Instant to resolve at (RFC 3339), defaults to now
    pub timestamp: Option<String>,
    /// Version to read, defaults to current
    pub version: Option<String>,
}

impl LookupQuery {
    fn timestamp(&self) -> std::result::Result<DateTime<Utc>, ApiError> {
        match &self.timestamp {
            Some(raw) => parse_timestamp("timestamp", raw),
            None => Ok(Utc::now()),
        }
    }

    fn version(&self) -> std::result::Result<Option<VersionId>, ApiError> {
        parse_version(self.version.as_deref())
    }
}

/// Export parameters
#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub version: Option<String>,
}

/// Parse an RFC 3339 instant, also accepting an offset whose `+` a query
/// string decoded into a space
fn parse_timestamp(field: &str, raw: &str) -> std::result::Result<DateTime<Utc>, ApiError> {
    parse_instant(raw)
        .or_else(|| parse_instant(&raw.replace(' ', "+")))
        .ok_or_else(|| {
            catalog_error(CatalogError::Validation(format!(
                "{field} is not a timestamp: {raw}"
            )))
        })
}

fn parse_optional_timestamp(
    field: &str,
    raw: Option<&str>,
) -> std::result::Result<Option<DateTime<Utc>>, ApiError> {
    raw.map(|raw| parse_timestamp(field, raw)).transpose()
}

fn parse_version(raw: Option<&str>) -> std::result::Result<Option<VersionId>, ApiError> {
    raw.map(|raw| {
        raw.parse::<VersionId>()
            .map_err(|e| catalog_error(CatalogError::Validation(e)))
    })
    .transpose()
}

fn parse_catalog(raw: &str) -> std::result::Result<CatalogKind, ApiError> {
    raw.parse()
        .map_err(|e| catalog_error(CatalogError::Validation(e)))
}

/// Corrected timestamp for a camera
#[derive(Debug, Serialize)]
pub struct CorrectionResponse {
    pub camera_id: String,
    pub original_timestamp: DateTime<Utc>,
    pub corrected_timestamp: DateTime<Utc>,
    pub delta_seconds: i64,
    /// Correction applied, if one was in effect
    pub correction: Option<Resolved<ClockCorrection>>,
}

#[derive(Debug, Deserialize)]
pub struct AddCorrectionRequest {
    pub camera_id: String,
    pub delta_seconds: i64,
    pub effective_from: String,
    pub effective_to: Option<String>,
    pub rule_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMappingRequest {
    pub camera_id: String,
    pub physical_serial: String,
    pub alias: Option<String>,
    /// Defaults to now
    pub effective_from: Option<String>,
    pub effective_to: Option<String>,
    pub map_version: Option<String>,
}

/// Outcome of a catalog write
#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub catalog: CatalogKind,
    pub version_id: VersionId,
}

#[derive(Debug, Serialize)]
pub struct SerialLookupResponse {
    pub physical_serial: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/manifest", get(get_manifest))
        .route("/api/v1/manifest/verify", get(verify_manifest))
        .route("/api/v1/corrections", post(add_correction))
        .route("/api/v1/corrections/:camera_id", get(get_correction))
        .route("/api/v1/cameras", post(add_mapping))
        .route("/api/v1/cameras/active", get(list_active_cameras))
        .route("/api/v1/cameras/:camera_id", get(get_camera))
        .route("/api/v1/serials/:physical_serial", get(get_camera_for_serial))
        .route("/api/v1/catalogs/:catalog/versions", get(list_versions))
        .route("/api/v1/catalogs/:catalog/export", get(export_catalog))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "metadata-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.manifest.get().await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "manifest": "readable"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "manifest": "unreadable",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn get_manifest(State(state): State<AppState>) -> ApiResult<ManifestRecord> {
    state.manifest.get().await.map(Json).map_err(catalog_error)
}

#[instrument(skip(state))]
async fn verify_manifest(State(state): State<AppState>) -> ApiResult<Vec<ManifestCheck>> {
    try_join_all(CatalogKind::ALL.map(|kind| state.manifest.verify(kind)))
        .await
        .map(Json)
        .map_err(catalog_error)
}

/// Apply the correction in effect for a camera at a timestamp
#[instrument(skip(state))]
async fn get_correction(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<LookupQuery>,
) -> ApiResult<CorrectionResponse> {
    let timestamp = params.timestamp()?;
    let version = params.version()?;

    let (corrected, correction) = state
        .corrections
        .apply_correction(&camera_id, timestamp, version)
        .await
        .map_err(catalog_error)?;

    Ok(Json(CorrectionResponse {
        camera_id,
        original_timestamp: timestamp,
        corrected_timestamp: corrected,
        delta_seconds: correction.as_ref().map_or(0, |c| c.payload().delta_seconds),
        correction,
    }))
}

#[instrument(skip(state))]
async fn add_correction(
    State(state): State<AppState>,
    Json(request): Json<AddCorrectionRequest>,
) -> std::result::Result<(StatusCode, Json<WriteResponse>), ApiError> {
    let effective_from = parse_timestamp("effective_from", &request.effective_from)?;
    let effective_to = parse_optional_timestamp("effective_to", request.effective_to.as_deref())?;

    let version_id = state
        .corrections
        .add_correction(
            &request.camera_id,
            request.delta_seconds,
            effective_from,
            effective_to,
            request.rule_id.as_deref(),
        )
        .await
        .map_err(catalog_error)?;

    Ok((
        StatusCode::CREATED,
        Json(WriteResponse {
            catalog: CatalogKind::ExifCorrections,
            version_id,
        }),
    ))
}

#[instrument(skip(state))]
async fn list_active_cameras(
    State(state): State<AppState>,
    Query(params): Query<LookupQuery>,
) -> ApiResult<Vec<Resolved<CameraBinding>>> {
    let timestamp = params.timestamp()?;
    let version = params.version()?;

    state
        .cameras
        .list_active(Some(timestamp), version)
        .await
        .map(Json)
        .map_err(catalog_error)
}

/// Full binding of a logical camera id
#[instrument(skip(state))]
async fn get_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<LookupQuery>,
) -> ApiResult<Resolved<CameraBinding>> {
    let timestamp = params.timestamp()?;
    let version = params.version()?;

    state
        .cameras
        .get_mapping_info(&camera_id, timestamp, version)
        .await
        .map_err(catalog_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("No mapping for camera {camera_id}")))
}

#[instrument(skip(state))]
async fn get_camera_for_serial(
    State(state): State<AppState>,
    Path(physical_serial): Path<String>,
    Query(params): Query<LookupQuery>,
) -> ApiResult<SerialLookupResponse> {
    let timestamp = params.timestamp()?;
    let version = params.version()?;

    let camera_id = state
        .cameras
        .get_camera_id(&physical_serial, timestamp, version)
        .await
        .map_err(catalog_error)?
        .ok_or_else(|| not_found(format!("No camera bound to serial {physical_serial}")))?;

    Ok(Json(SerialLookupResponse {
        physical_serial,
        camera_id,
        timestamp,
    }))
}

#[instrument(skip(state))]
async fn add_mapping(
    State(state): State<AppState>,
    Json(request): Json<AddMappingRequest>,
) -> std::result::Result<(StatusCode, Json<WriteResponse>), ApiError> {
    let effective_from =
        parse_optional_timestamp("effective_from", request.effective_from.as_deref())?;
    let effective_to = parse_optional_timestamp("effective_to", request.effective_to.as_deref())?;

    let version_id = state
        .cameras
        .add_mapping(
            &request.camera_id,
            &request.physical_serial,
            request.alias,
            effective_from,
            effective_to,
            request.map_version.as_deref(),
        )
        .await
        .map_err(catalog_error)?;

    Ok((
        StatusCode::CREATED,
        Json(WriteResponse {
            catalog: CatalogKind::CameraMapping,
            version_id,
        }),
    ))
}

#[instrument(skip(state))]
async fn list_versions(
    State(state): State<AppState>,
    Path(catalog): Path<String>,
) -> ApiResult<Vec<VersionDescriptor>> {
    let versions = match parse_catalog(&catalog)? {
        CatalogKind::ExifCorrections => state.corrections.list_versions().await,
        CatalogKind::CameraMapping => state.cameras.list_versions().await,
    };

    versions.map(Json).map_err(catalog_error)
}

#[instrument(skip(state))]
async fn export_catalog(
    State(state): State<AppState>,
    Path(catalog): Path<String>,
    Query(params): Query<ExportQuery>,
) -> ApiResult<SnapshotTable> {
    let version = parse_version(params.version.as_deref())?;

    let table = match parse_catalog(&catalog)? {
        CatalogKind::ExifCorrections => state.corrections.export_snapshot(version).await,
        CatalogKind::CameraMapping => state.cameras.export_snapshot(version).await,
    };

    table.map(Json).map_err(catalog_error)
}

/// Start the metadata API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting metadata API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
