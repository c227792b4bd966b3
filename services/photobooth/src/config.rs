use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the photobooth service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Binary object store configuration
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// Database configuration (records and staging bindings)
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Image normalization bounds
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    /// Record validation limits
    #[serde(default)]
    pub records: RecordsConfig,
    /// Staging binding behaviour
    #[serde(default)]
    pub staging: StagingConfig,
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

/// Which backend holds image payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectBackend {
    S3,
    Memory,
}

/// Which backend holds records and staging bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Memory,
}

/// Binary object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Storage backend
    #[serde(default = "default_object_backend")]
    pub backend: ObjectBackend,
    /// S3 bucket name for image payloads
    #[serde(default)]
    pub bucket: Option<String>,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for stored objects
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Part size for multipart uploads in bytes (5MB minimum on S3)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Chunk size used when writing to and streaming from the store
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Storage backend
    #[serde(default = "default_database_backend")]
    pub backend: DatabaseBackend,
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Size and quality bounds for one entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct NormalizeBounds {
    /// Maximum output width in pixels; narrower images are never upscaled
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,
}

/// Normalization bounds per entry point
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    /// Bounds for camera captures
    #[serde(default)]
    pub capture: NormalizeBounds,
    /// Bounds for file uploads
    #[serde(default)]
    pub upload: NormalizeBounds,
}

/// Record metadata limits
#[derive(Debug, Clone, Deserialize)]
pub struct RecordsConfig {
    /// Maximum comment length in characters
    #[serde(default = "default_max_comment_chars")]
    pub max_comment_chars: usize,
    /// Maximum length of name and contact fields in characters
    #[serde(default = "default_max_field_chars")]
    pub max_field_chars: usize,
}

/// Staging binding behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Delete the previously staged object when a new upload replaces it
    #[serde(default = "default_true")]
    pub reap_replaced: bool,
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
    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "photobooth-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_object_backend() -> ObjectBackend {
    ObjectBackend::S3
}

fn default_database_backend() -> DatabaseBackend {
    DatabaseBackend::Postgres
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "photos".to_string()
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_chunk_size() -> usize {
    255 * 1024 // 255KB, the usual large-object chunk
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_width() -> u32 {
    800
}

fn default_quality() -> u8 {
    60
}

fn default_max_comment_chars() -> usize {
    500
}

fn default_max_field_chars() -> usize {
    100
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3500
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "photobooth-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/photobooth").required(false))
            .add_source(config::File::with_name("/etc/photobooth/photobooth").required(false))
            // Override with environment variables
            // PHOTOBOOTH__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("PHOTOBOOTH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field requirements that serde defaults cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.object_store.backend == ObjectBackend::S3 && self.object_store.bucket.is_none() {
            anyhow::bail!("object_store.bucket is required for the s3 backend");
        }
        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_none() {
            anyhow::bail!("database.url is required for the postgres backend");
        }
        for (name, bounds) in [
            ("capture", &self.normalizer.capture),
            ("upload", &self.normalizer.upload),
        ] {
            if bounds.max_width == 0 {
                anyhow::bail!("normalizer.{name}.max_width must be positive");
            }
            if !(1..=100).contains(&bounds.quality) {
                anyhow::bail!("normalizer.{name}.quality must be between 1 and 100");
            }
        }
        if self.object_store.chunk_size_bytes == 0 {
            anyhow::bail!("object_store.chunk_size_bytes must be positive");
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            object_store: ObjectStoreConfig::default(),
            database: DatabaseConfig::default(),
            normalizer: NormalizerConfig::default(),
            records: RecordsConfig::default(),
            staging: StagingConfig::default(),
            api: ApiConfig::default(),
        }
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

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_object_backend(),
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            key_prefix: default_key_prefix(),
            part_size_bytes: default_part_size(),
            chunk_size_bytes: default_chunk_size(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_database_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for NormalizeBounds {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            quality: default_quality(),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            capture: NormalizeBounds::default(),
            upload: NormalizeBounds::default(),
        }
    }
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            max_comment_chars: default_max_comment_chars(),
            max_field_chars: default_max_field_chars(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            reap_replaced: default_true(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}
