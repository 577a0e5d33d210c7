//! Provider Registry - resource adapters selected by name
//!
//! A provider binds one resource type to local storage and to the sync
//! client. The direction decides which method set it implements:
//! - `FetchProvider`: pull remote changes into the local store
//! - `SendProvider`: push local records to the server
//!
//! The method sets are traits, so an adapter missing a method is rejected by
//! the compiler instead of at first use.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::api::SyncApiError;
use super::models::{Direction, ResourceMap, ResourceRecord};
use crate::db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Remote error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Local store error: {0}")]
    Store(#[from] DbError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider name must not be empty")]
    InvalidName,

    #[error("No provider registered for '{0}'")]
    NotRegistered(String),
}

/// Adapter that pulls one resource type from the server
#[async_trait]
pub trait FetchProvider: Send + Sync {
    /// One-time setup, run before the first synchronization
    async fn init(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Ids and checksums of the remote resources
    async fn get_remote_resource_ids(&self) -> Result<ResourceMap, ProviderError>;

    /// Full remote records for exactly the requested ids
    async fn get_remote_resources(&self, ids: &[String]) -> Result<ResourceMap, ProviderError>;

    /// Locally cached records
    async fn get_local_resources(&self) -> Result<ResourceMap, ProviderError>;

    async fn add_resource(&self, record: ResourceRecord) -> Result<(), ProviderError>;

    async fn update_resource(&self, record: ResourceRecord) -> Result<(), ProviderError>;

    async fn remove_resource(&self, id: &str) -> Result<(), ProviderError>;
}

/// Adapter that pushes one resource type to the server
#[async_trait]
pub trait SendProvider: Send + Sync {
    /// One-time setup, run before the first synchronization
    async fn init(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Local records eligible for sending
    async fn get_local_resources(&self) -> Result<ResourceMap, ProviderError>;

    /// Push one record; `true` when the server accepted it
    async fn send_resource(&self, record: &ResourceRecord) -> Result<bool, ProviderError>;

    async fn remove_resource(&self, id: &str) -> Result<(), ProviderError>;
}

/// A registered adapter, tagged with its direction
#[derive(Clone)]
pub enum Provider {
    Fetch(Arc<dyn FetchProvider>),
    Send(Arc<dyn SendProvider>),
}

impl Provider {
    pub fn fetch<P: FetchProvider + 'static>(provider: P) -> Self {
        Provider::Fetch(Arc::new(provider))
    }

    pub fn send<P: SendProvider + 'static>(provider: P) -> Self {
        Provider::Send(Arc::new(provider))
    }

    pub fn direction(&self) -> Direction {
        match self {
            Provider::Fetch(_) => Direction::Fetch,
            Provider::Send(_) => Direction::Send,
        }
    }

    pub async fn init(&self) -> Result<(), ProviderError> {
        match self {
            Provider::Fetch(p) => p.init().await,
            Provider::Send(p) => p.init().await,
        }
    }
}

/// Name-keyed provider registry
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
    /// Registration order, used when synchronizing everything
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the provider of a resource type
    pub fn register(&mut self, name: impl Into<String>, provider: Provider) -> Result<(), RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidName);
        }

        log::debug!("Registering {} provider '{}'", provider.direction().as_str(), name);

        if self.providers.insert(name.clone(), provider).is_some() {
            log::warn!("Provider '{}' was already registered, replacing it", name);
        } else {
            self.order.push(name);
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Provider, RegistryError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered names, in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
