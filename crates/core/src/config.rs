//! Centralized configuration management.
//!
//! All configuration is loaded from environment variables at startup.
//! This provides a single source of truth and fails fast if required config is missing.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub services: ServicesConfig,
    pub limits: BatchLimitsConfig,
    pub auth: AuthConfig,
    pub server: ServerConfig,
    pub observability: ObservabilityConfig,
    pub tls: TlsConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

/// NATS configuration: broker URL plus the two analysis subjects.
///
/// `queue_subject` backs the durable work queue (JetStream, work-queue
/// retention); `updates_subject` is the non-durable progress fan-out.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub queue_subject: String,
    pub updates_subject: String,
}

/// Base URLs of the collaborating services
#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub auth_service_url: String,
    pub files_service_url: String,
    pub detector_url: String,
    pub annotation_service_url: String,
}

/// Batch intake and processing limits
#[derive(Debug, Clone)]
pub struct BatchLimitsConfig {
    /// Maximum number of files in one batch submission
    pub max_batch_files: usize,
    /// Maximum combined size of one batch submission in bytes
    pub max_batch_size_bytes: u64,
    /// Hard ceiling on previews kept per task
    pub preview_limit: usize,
    /// How many intake files are persisted as preview rows before queueing
    pub upload_preview_limit: usize,
    /// Per-image payload cap for the detector, in megabytes
    pub max_detector_file_size_mb: u64,
}

/// Bearer-token verification settings.
///
/// Token issuance lives in the external auth service; this service only
/// verifies the HMAC signature. `backend_local` disables verification for
/// local development.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret_key: Option<String>,
    pub algorithm: String,
    pub backend_local: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
    pub shutdown_timeout_secs: Option<u64>,
}

/// Observability configuration
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub service_name: String,
    pub log_format: LogFormat,
}

/// Log format type
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// TLS configuration for the server listener.
///
/// Outbound client TLS (`TLS_CA_CERT_PATH`, `CLIENT_MTLS_ENABLED`,
/// `TLS_CLIENT_*`) is consumed by the shared HTTP client in
/// [`crate::http_client`].
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Enable TLS/SSL on the server
    pub server_ssl_enabled: bool,
    /// Path to server certificate file (PEM format)
    pub server_cert_path: Option<String>,
    /// Path to server private key file (PEM format)
    pub server_key_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// This should be called once at application startup.
    /// It will fail fast if required configuration is missing.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            nats: NatsConfig::from_env()?,
            services: ServicesConfig::from_env(),
            limits: BatchLimitsConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            server: ServerConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
            tls: TlsConfig::from_env()?,
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("ANALYSIS_DATABASE_URL").context("ANALYSIS_DATABASE_URL is required")?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("DB_MAX_CONNECTIONS must be a number")?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("DB_MIN_CONNECTIONS must be a number")?,
            acquire_timeout: Duration::from_secs(
                env::var("DB_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("DB_ACQUIRE_TIMEOUT_SECS must be a number")?,
            ),
            idle_timeout: Duration::from_secs(
                env::var("DB_IDLE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .context("DB_IDLE_TIMEOUT_SECS must be a number")?,
            ),
            max_lifetime: Duration::from_secs(
                env::var("DB_MAX_LIFETIME_SECS")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()
                    .context("DB_MAX_LIFETIME_SECS must be a number")?,
            ),
        })
    }
}

impl NatsConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            queue_subject: env::var("ANALYSIS_QUEUE_NAME")
                .unwrap_or_else(|_| crate::subjects::DEFAULT_QUEUE_SUBJECT.to_string()),
            updates_subject: env::var("ANALYSIS_UPDATES_EXCHANGE")
                .unwrap_or_else(|_| crate::subjects::DEFAULT_UPDATES_SUBJECT.to_string()),
        })
    }
}

impl ServicesConfig {
    pub fn from_env() -> Self {
        Self {
            auth_service_url: env::var("AUTH_SERVICE_URL")
                .unwrap_or_else(|_| "http://auth-service:8002".to_string()),
            files_service_url: env::var("FILES_SERVICE_URL")
                .unwrap_or_else(|_| "http://files-service:8006".to_string()),
            detector_url: env::var("YOLOV8_SERVICE_URL")
                .unwrap_or_else(|_| "http://yolov8-model-service:8000".to_string()),
            annotation_service_url: env::var("ANNOTATION_SERVICE_URL")
                .unwrap_or_else(|_| "http://annotation-service:8000".to_string()),
        }
    }
}

impl BatchLimitsConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_batch_files: env::var("MAX_BATCH_FILES")
                .unwrap_or_else(|_| "50000".to_string())
                .parse()
                .context("MAX_BATCH_FILES must be a number")?,
            max_batch_size_bytes: env::var("MAX_BATCH_SIZE_BYTES")
                .unwrap_or_else(|_| (10u64 * 1024 * 1024 * 1024).to_string())
                .parse()
                .context("MAX_BATCH_SIZE_BYTES must be a number")?,
            preview_limit: env::var("PREVIEW_LIMIT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("PREVIEW_LIMIT must be a number")?,
            upload_preview_limit: env::var("UPLOAD_PREVIEW_LIMIT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("UPLOAD_PREVIEW_LIMIT must be a number")?,
            max_detector_file_size_mb: env::var("MAX_YOLO_FILE_SIZE_MB")
                .unwrap_or_else(|_| "512".to_string())
                .parse()
                .context("MAX_YOLO_FILE_SIZE_MB must be a number")?,
        })
    }

    pub fn max_detector_file_size_bytes(&self) -> u64 {
        self.max_detector_file_size_mb * 1024 * 1024
    }
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        let backend_local = env::var("BACKEND_LOCAL")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        Ok(Self {
            secret_key: env::var("SECRET_KEY").ok().filter(|s| !s.is_empty()),
            algorithm: env::var("ALGORITHM").unwrap_or_else(|_| "HS256".to_string()),
            backend_local,
        })
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let cors_origins = env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_string())
            .collect();

        let shutdown_timeout_secs = env::var("SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok());

        Ok(Self {
            hostname: env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a number")?,
            cors_allowed_origins: cors_origins,
            shutdown_timeout_secs,
        })
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Result<Self> {
        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "json".to_string())
            .to_lowercase()
            .as_str()
        {
            "pretty" | "human" | "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "lineguard".to_string()),
            log_format,
        })
    }
}

impl TlsConfig {
    pub fn from_env() -> Result<Self> {
        let server_ssl_enabled = env::var("SERVER_SSL_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        // Validate server SSL configuration
        let (server_cert_path, server_key_path) = if server_ssl_enabled {
            let cert_path = env::var("TLS_SERVER_CERT_PATH")
                .context("TLS_SERVER_CERT_PATH is required when SERVER_SSL_ENABLED=true")?;
            let key_path = env::var("TLS_SERVER_KEY_PATH")
                .context("TLS_SERVER_KEY_PATH is required when SERVER_SSL_ENABLED=true")?;
            (Some(cert_path), Some(key_path))
        } else {
            (None, None)
        };

        Ok(Self {
            server_ssl_enabled,
            server_cert_path,
            server_key_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        let config = ObservabilityConfig {
            service_name: "test".to_string(),
            log_format: LogFormat::Json,
        };
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_detector_size_cap_in_bytes() {
        let limits = BatchLimitsConfig {
            max_batch_files: 50_000,
            max_batch_size_bytes: 10 * 1024 * 1024 * 1024,
            preview_limit: 10,
            upload_preview_limit: 10,
            max_detector_file_size_mb: 512,
        };
        assert_eq!(limits.max_detector_file_size_bytes(), 512 * 1024 * 1024);
    }
}
