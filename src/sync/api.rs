//! Sync API Client - resource-oriented calls to the assessment server
//!
//! Handles all REST API calls made during synchronization:
//! - Entity id/checksum listing (paginated through `nextCallUrl`)
//! - Entity content batches
//! - Delivery assembly download
//! - Result push
//!
//! Every call goes through `call()`, which retries exactly once with a
//! freshly requested token when the server answers 401 or 403.

use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use super::models::{ResourceMap, ResourceRecord};
use super::token::{TokenError, TokenService};
use super::transport::{ApiRequest, HttpTransport, ResponseData, ResponseType, TransportError};
use crate::cache::TokenCache;
use crate::config::{ApiRoutes, ConfigError, SyncConfig};

/// API client for the assessment server
pub struct SyncApiClient {
    transport: HttpTransport,
    tokens: Arc<TokenService>,
    routes: ApiRoutes,
}

impl SyncApiClient {
    pub fn new(transport: HttpTransport, tokens: Arc<TokenService>, routes: ApiRoutes) -> Self {
        Self {
            transport,
            tokens,
            routes,
        }
    }

    /// Build transport, token service and client from configuration
    pub fn from_config(config: &SyncConfig, cache: TokenCache) -> Result<Self, SyncApiError> {
        config.validate()?;

        let transport = HttpTransport::new(config.endpoint.clone(), config.timeout())?;
        let tokens = TokenService::new(
            transport.clone(),
            cache,
            config.credentials.clone(),
            config.routes.token.clone(),
        );

        Ok(Self::new(transport, Arc::new(tokens), config.routes.clone()))
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Ids and checksums of every remote entity of a type, merged across pages
    pub async fn get_entity_ids(
        &self,
        resource_type: &str,
        cursor: Option<String>,
    ) -> Result<ResourceMap, SyncApiError> {
        let mut entities = ResourceMap::new();
        let mut visited = HashSet::new();
        let mut cursor = cursor;
        let mut pages = 0usize;

        loop {
            let request = match &cursor {
                Some(next) => {
                    if !is_same_origin(self.transport.endpoint(), next) {
                        return Err(SyncApiError::InvalidResponse(format!(
                            "refusing to follow cursor to another server: {}",
                            next
                        )));
                    }
                    visited.insert(next.clone());
                    ApiRequest::new(self.routes.entity_ids.method()?, next.clone())
                }
                None => self.routes.entity_ids.request()?.with_query("type", resource_type),
            };

            let data = unwrap_envelope(self.call(request).await?.into_json()?)?;
            let page = records_from_value(data.get("entities").cloned().unwrap_or(Value::Null))?;
            pages += 1;
            entities.extend(page);

            // Stop when the server stops handing out new cursors
            match data.get("nextCallUrl").and_then(Value::as_str) {
                Some(next) if !next.is_empty() && !visited.contains(next) => {
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }

        log::debug!("Listed {} remote {} ids over {} page(s)", entities.len(), resource_type, pages);
        Ok(entities)
    }

    /// Full records of the given ids
    pub async fn get_entities_content(
        &self,
        resource_type: &str,
        ids: &[String],
    ) -> Result<ResourceMap, SyncApiError> {
        if ids.is_empty() {
            return Ok(ResourceMap::new());
        }

        let mut request = self.routes.entity_content.request()?;
        request = if request.method == Method::GET {
            request
                .with_query("type", resource_type)
                .with_query("entityIds", json!(ids))
        } else {
            request.with_body(json!({ "type": resource_type, "entityIds": ids }))
        };

        let data = unwrap_envelope(self.call(request).await?.into_json()?)?;
        let mut records = records_from_value(data)?;

        let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let before = records.len();
        records.retain(|id, _| requested.contains(id.as_str()));
        if records.len() != before {
            log::warn!(
                "Server returned {} unrequested {} record(s), ignoring them",
                before - records.len(),
                resource_type
            );
        }

        Ok(records)
    }

    /// Binary package of one delivery
    pub async fn download_delivery_assembly(&self, delivery_id: &str) -> Result<Vec<u8>, SyncApiError> {
        let request = self
            .routes
            .delivery_assembly
            .request()?
            .with_query("deliveryId", delivery_id)
            .expect(ResponseType::Binary);

        let bytes = self.call(request).await?.into_bytes();
        log::debug!("Downloaded assembly of delivery {} ({} bytes)", delivery_id, bytes.len());

        Ok(bytes)
    }

    /// Push one local record; returns whether the server accepted it
    pub async fn send_resource(
        &self,
        resource_type: &str,
        record: &ResourceRecord,
    ) -> Result<bool, SyncApiError> {
        let request = self
            .routes
            .send_resource
            .request()?
            .with_body(json!({ "type": resource_type, "resource": record }));

        let body = self.call(request).await?.into_json()?;
        match unwrap_envelope(body) {
            Ok(_) => Ok(true),
            Err(SyncApiError::Rejected(message)) => {
                log::warn!("Server rejected {} {}: {}", resource_type, record.id, message);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Perform an authenticated call, retrying once on 401/403
    async fn call(&self, request: ApiRequest) -> Result<ResponseData, SyncApiError> {
        let token = self.tokens.get_token().await?;

        match self.transport.send(&request.clone().bearer(&token.access_token)).await {
            Err(e) if e.is_auth_failure() => {
                log::warn!(
                    "{} {} answered {}, retrying with a fresh token",
                    request.method,
                    request.path,
                    e.code()
                );
                let token = self.tokens.request_token().await?;
                Ok(self.transport.send(&request.bearer(&token.access_token)).await?)
            }
            result => Ok(result?),
        }
    }
}

// ============================================================================
// Wire Format
// ============================================================================

/// Relative cursors resolve against the endpoint; absolute ones must share its origin
fn is_same_origin(endpoint: &str, cursor: &str) -> bool {
    let cursor = match url::Url::parse(cursor) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => return true,
        Err(_) => return false,
    };

    match url::Url::parse(endpoint) {
        Ok(endpoint) => endpoint.origin() == cursor.origin(),
        Err(_) => false,
    }
}

/// Extract `data` from a `{success, data}` envelope
fn unwrap_envelope(body: Value) -> Result<Value, SyncApiError> {
    match body.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
        Some(false) => {
            let message = ["errorMessage", "message", "error"]
                .iter()
                .find_map(|key| body.get(*key).and_then(Value::as_str))
                .unwrap_or("request was not successful");
            Err(SyncApiError::Rejected(message.to_string()))
        }
        None => Err(SyncApiError::InvalidResponse("missing success flag".to_string())),
    }
}

/// Decode an id-keyed object (or a list, or nothing) into records
fn records_from_value(value: Value) -> Result<ResourceMap, SyncApiError> {
    let entries: Vec<(Option<String>, Value)> = match value {
        Value::Null => Vec::new(),
        Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
        Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
        other => {
            return Err(SyncApiError::InvalidResponse(format!(
                "expected an entity map, got {}",
                other
            )))
        }
    };

    let mut records = ResourceMap::new();
    for (key, value) in entries {
        let mut fields: Map<String, Value> = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(SyncApiError::InvalidResponse(format!("invalid entity: {}", other)));
            }
        };

        if let Some(key) = key {
            fields.entry("id").or_insert(Value::String(key));
        }
        // Some servers send numeric checksums
        if let Some(checksum) = fields.get_mut("checksum") {
            if checksum.is_number() {
                *checksum = Value::String(checksum.to_string());
            }
        }

        let record: ResourceRecord = serde_json::from_value(Value::Object(fields))
            .map_err(|e| SyncApiError::InvalidResponse(e.to_string()))?;
        records.insert(record.id.clone(), record);
    }

    Ok(records)
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication failed: {0}")]
    Token(#[from] TokenError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

impl SyncApiError {
    /// HTTP-level error code, when there is one
    pub fn code(&self) -> Option<u16> {
        match self {
            SyncApiError::Transport(e) => Some(e.code()),
            SyncApiError::Token(e) => e.code(),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
