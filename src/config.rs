//! Sync client configuration
//!
//! Endpoint, credentials, per-call routes, request timeout and chunk size.
//! Values come from `ASSESSMENT_SYNC_*` environment variables (a `.env` file is
//! honoured by the binary through dotenvy) and fall back to the defaults below.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::transport::ApiRequest;

const ENV_PREFIX: &str = "ASSESSMENT_SYNC_";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

// ============================================================================
// Routes
// ============================================================================

/// HTTP method and path of one remote call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub method: String,
    pub path: String,
}

impl Route {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
        }
    }

    pub fn method(&self) -> Result<Method, ConfigError> {
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes()).map_err(|_| ConfigError::Invalid {
            key: format!("route {}", self.path),
            message: format!("unknown HTTP method '{}'", self.method),
        })
    }

    /// Start a request for this route
    pub fn request(&self) -> Result<ApiRequest, ConfigError> {
        Ok(ApiRequest::new(self.method()?, self.path.clone()))
    }
}

/// Routes of every remote call made by the sync client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRoutes {
    /// Credential exchange
    pub token: Route,
    /// Id + checksum listing, paginated
    pub entity_ids: Route,
    /// Full records for a batch of ids
    pub entity_content: Route,
    /// Binary package of a delivery
    pub delivery_assembly: Route,
    /// Push of one local record
    pub send_resource: Route,
}

impl Default for ApiRoutes {
    fn default() -> Self {
        Self {
            token: Route::new("POST", "/api/v1/auth/token"),
            entity_ids: Route::new("GET", "/api/v1/sync/entity-ids"),
            entity_content: Route::new("POST", "/api/v1/sync/entity-content"),
            delivery_assembly: Route::new("GET", "/api/v1/sync/delivery-assembly"),
            send_resource: Route::new("POST", "/api/v1/sync/results"),
        }
    }
}

// ============================================================================
// Sync Configuration
// ============================================================================

/// Client credentials for the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Key under which the token of these credentials is cached
    pub fn key(&self) -> &str {
        &self.client_id
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the assessment server
    pub endpoint: String,

    pub credentials: Credentials,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum number of ids per content request (fetch workflow)
    pub chunk_size: usize,

    pub routes: ApiRoutes,

    /// Background sync interval in minutes (0 = manual only)
    pub sync_interval_minutes: u64,

    /// Local database file; `None` uses the platform data directory
    pub database_path: Option<PathBuf>,

    /// Days of sync history kept after each sync (0 = keep everything)
    pub history_retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credentials: Credentials::new("", ""),
            timeout_secs: 30,
            chunk_size: 100,
            routes: ApiRoutes::default(),
            sync_interval_minutes: 0,
            database_path: None,
            history_retention_days: 30,
        }
    }
}

impl SyncConfig {
    /// Default settings for one server and client
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            ..Self::default()
        }
    }

    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = SyncConfig::default();

        if let Some(endpoint) = get("ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(client_id) = get("CLIENT_ID") {
            config.credentials.client_id = client_id;
        }
        if let Some(client_secret) = get("CLIENT_SECRET") {
            config.credentials.client_secret = client_secret;
        }
        if let Some(timeout) = get("TIMEOUT_SECS") {
            config.timeout_secs = parse_number("TIMEOUT_SECS", &timeout)?;
        }
        if let Some(chunk_size) = get("CHUNK_SIZE") {
            config.chunk_size = parse_number("CHUNK_SIZE", &chunk_size)?;
        }
        if let Some(interval) = get("INTERVAL_MINUTES") {
            config.sync_interval_minutes = parse_number("INTERVAL_MINUTES", &interval)?;
        }
        if let Some(path) = get("DATABASE") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(days) = get("HISTORY_RETENTION_DAYS") {
            config.history_retention_days = parse_number("HISTORY_RETENTION_DAYS", &days)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing(format!("{}ENDPOINT", ENV_PREFIX)));
        }
        if url::Url::parse(&self.endpoint).is_err() {
            return Err(ConfigError::Invalid {
                key: "endpoint".to_string(),
                message: format!("'{}' is not a valid URL", self.endpoint),
            });
        }
        if self.credentials.client_id.is_empty() {
            return Err(ConfigError::Missing(format!("{}CLIENT_ID", ENV_PREFIX)));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                key: "chunk_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "timeout_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        for route in [
            &self.routes.token,
            &self.routes.entity_ids,
            &self.routes.entity_content,
            &self.routes.delivery_assembly,
            &self.routes.send_resource,
        ] {
            route.method()?;
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Database location, defaulting to the platform data directory
    pub fn resolve_database_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.database_path {
            return Some(path.clone());
        }

        directories::ProjectDirs::from("org", "assessment", "assessment-sync")
            .map(|dirs| dirs.data_dir().join("assessment-sync.db"))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key: format!("{}{}", ENV_PREFIX, key),
        message: format!("'{}' is not a number", value),
    })
}
