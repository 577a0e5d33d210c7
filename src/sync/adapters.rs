//! Resource adapters backed by the local database and the sync client
//!
//! - test-taker, eligibility: plain fetch adapters
//! - delivery: fetch adapter that also keeps the delivery assembly
//! - result: send adapter pushing locally produced results

use async_trait::async_trait;
use std::sync::Arc;

use super::api::SyncApiClient;
use super::models::{ResourceMap, ResourceRecord};
use super::provider::{FetchProvider, Provider, ProviderError, ProviderRegistry, RegistryError, SendProvider};
use crate::db::Database;

pub const TEST_TAKER: &str = "test-taker";
pub const DELIVERY: &str = "delivery";
pub const ELIGIBILITY: &str = "eligibility";
pub const RESULT: &str = "result";

/// Every built-in resource type, in synchronization order
pub const RESOURCE_TYPES: [&str; 4] = [TEST_TAKER, DELIVERY, ELIGIBILITY, RESULT];

/// Register the built-in adapters
pub fn register_default_providers(
    registry: &mut ProviderRegistry,
    db: Arc<Database>,
    api: Arc<SyncApiClient>,
) -> Result<(), RegistryError> {
    registry.register(
        TEST_TAKER,
        Provider::fetch(EntityFetchProvider::new(TEST_TAKER, db.clone(), api.clone())),
    )?;
    registry.register(DELIVERY, Provider::fetch(DeliveryProvider::new(db.clone(), api.clone())))?;
    registry.register(
        ELIGIBILITY,
        Provider::fetch(EntityFetchProvider::new(ELIGIBILITY, db.clone(), api.clone())),
    )?;
    registry.register(RESULT, Provider::send(ResultSendProvider::new(db, api)))?;

    Ok(())
}

// ============================================================================
// Entity Fetch Adapter
// ============================================================================

/// Mirrors one remote entity type into the `resources` table
pub struct EntityFetchProvider {
    resource_type: String,
    db: Arc<Database>,
    api: Arc<SyncApiClient>,
}

impl EntityFetchProvider {
    pub fn new(resource_type: impl Into<String>, db: Arc<Database>, api: Arc<SyncApiClient>) -> Self {
        Self {
            resource_type: resource_type.into(),
            db,
            api,
        }
    }
}

#[async_trait]
impl FetchProvider for EntityFetchProvider {
    async fn get_remote_resource_ids(&self) -> Result<ResourceMap, ProviderError> {
        Ok(self.api.get_entity_ids(&self.resource_type, None).await?)
    }

    async fn get_remote_resources(&self, ids: &[String]) -> Result<ResourceMap, ProviderError> {
        Ok(self.api.get_entities_content(&self.resource_type, ids).await?)
    }

    async fn get_local_resources(&self) -> Result<ResourceMap, ProviderError> {
        Ok(self.db.list_resources(&self.resource_type)?)
    }

    async fn add_resource(&self, record: ResourceRecord) -> Result<(), ProviderError> {
        Ok(self.db.upsert_resource(&self.resource_type, &record)?)
    }

    async fn update_resource(&self, record: ResourceRecord) -> Result<(), ProviderError> {
        Ok(self.db.upsert_resource(&self.resource_type, &record)?)
    }

    async fn remove_resource(&self, id: &str) -> Result<(), ProviderError> {
        if !self.db.delete_resource(&self.resource_type, id)? {
            log::debug!("{} {} was already gone", self.resource_type, id);
        }
        Ok(())
    }
}

// ============================================================================
// Delivery Adapter
// ============================================================================

/// Deliveries carry a binary assembly, downloaded whenever the record changes
pub struct DeliveryProvider {
    entities: EntityFetchProvider,
}

impl DeliveryProvider {
    pub fn new(db: Arc<Database>, api: Arc<SyncApiClient>) -> Self {
        Self {
            entities: EntityFetchProvider::new(DELIVERY, db, api),
        }
    }

    async fn store(&self, record: ResourceRecord) -> Result<(), ProviderError> {
        let assembly = self.entities.api.download_delivery_assembly(&record.id).await?;
        self.entities
            .db
            .upsert_resource_with_assembly(DELIVERY, &record, &assembly)?;
        Ok(())
    }
}

#[async_trait]
impl FetchProvider for DeliveryProvider {
    async fn get_remote_resource_ids(&self) -> Result<ResourceMap, ProviderError> {
        self.entities.get_remote_resource_ids().await
    }

    async fn get_remote_resources(&self, ids: &[String]) -> Result<ResourceMap, ProviderError> {
        self.entities.get_remote_resources(ids).await
    }

    async fn get_local_resources(&self) -> Result<ResourceMap, ProviderError> {
        self.entities.get_local_resources().await
    }

    async fn add_resource(&self, record: ResourceRecord) -> Result<(), ProviderError> {
        self.store(record).await
    }

    async fn update_resource(&self, record: ResourceRecord) -> Result<(), ProviderError> {
        self.store(record).await
    }

    async fn remove_resource(&self, id: &str) -> Result<(), ProviderError> {
        self.entities.db.delete_resource_with_assembly(DELIVERY, id)?;
        Ok(())
    }
}

// ============================================================================
// Result Send Adapter
// ============================================================================

/// Pushes locally stored test results, dropping each one the server accepts
pub struct ResultSendProvider {
    db: Arc<Database>,
    api: Arc<SyncApiClient>,
}

impl ResultSendProvider {
    pub fn new(db: Arc<Database>, api: Arc<SyncApiClient>) -> Self {
        Self { db, api }
    }
}

#[async_trait]
impl SendProvider for ResultSendProvider {
    async fn get_local_resources(&self) -> Result<ResourceMap, ProviderError> {
        Ok(self.db.list_resources(RESULT)?)
    }

    async fn send_resource(&self, record: &ResourceRecord) -> Result<bool, ProviderError> {
        Ok(self.api.send_resource(RESULT, record).await?)
    }

    async fn remove_resource(&self, id: &str) -> Result<(), ProviderError> {
        self.db.delete_resource(RESULT, id)?;
        Ok(())
    }
}
