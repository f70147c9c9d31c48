use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the metadata service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Catalog storage configuration
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket holding the metadata catalogs
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Catalog layout and write policy
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Blob path prefix shared by both catalogs and the manifest
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Attempts per write before a conflict is surfaced to the caller
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    /// Initial delay between conflicting write attempts
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on the delay between attempts
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Processing pipeline version recorded in the manifest
    #[serde(default = "default_processing_version")]
    pub processing_version: String,
    /// Repair the manifest from stored versions at startup
    #[serde(default = "default_true")]
    pub reconcile_on_startup: bool,
    /// Write columnar exports of the current catalogs at startup
    #[serde(default)]
    pub export_on_startup: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "metadata-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "metadata".to_string()
}

fn default_max_write_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}

fn default_processing_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "metadata-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/metadata").required(false))
            .add_source(config::File::with_name("/etc/camtrap/metadata").required(false))
            // Override with environment variables
            // METADATA__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("METADATA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }

        if self.catalog.prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::MissingRequired("catalog.prefix".to_string()));
        }

        if self.catalog.max_write_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "catalog.max_write_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.catalog.retry_base_delay_ms > self.catalog.retry_max_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "catalog.retry_base_delay_ms".to_string(),
                message: "must not exceed catalog.retry_max_delay_ms".to_string(),
            });
        }

        Ok(())
    }
}

impl CatalogConfig {
    /// Prefix with any trailing slash removed
    pub fn normalized_prefix(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    /// Get the initial retry delay as Duration
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Get the maximum retry delay as Duration
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_write_attempts: default_max_write_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            processing_version: default_processing_version(),
            reconcile_on_startup: true,
            export_on_startup: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
