//! Sync Module - Resource Synchronization Engine
//!
//! Keeps locally cached assessment resources (test-takers, deliveries,
//! eligibilities, results) in line with the remote server:
//! - Fetch providers pull remote changes, detected by checksum
//! - Send providers push local records and drop the accepted ones
//!
//! Layers, leaves first:
//! - transport: HTTP calls with uniform status mapping
//! - token: cached bearer token acquisition
//! - api: resource calls with one-shot re-authentication
//! - provider / diff / synchronizer: the engine itself
//! - adapters / manager / history / scheduler: wiring for the built-in types

pub mod transport;
pub mod models;
pub mod token;
pub mod api;
pub mod provider;
pub mod diff;
pub mod synchronizer;
pub mod adapters;
pub mod history;
pub mod manager;
pub mod scheduler;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use transport::{ApiRequest, HttpTransport, ResponseData, ResponseType, TransportError};

pub use models::{
    ResourceRecord, ResourceMap, resource_map,
    Direction, FetchOperations, SendOperations, SyncReport,
    Token,
};

pub use token::{TokenService, TokenError};
pub use api::{SyncApiClient, SyncApiError};
pub use provider::{FetchProvider, SendProvider, Provider, ProviderRegistry, ProviderError, RegistryError};
pub use diff::{compute_needed_operations, chunk_ids};
pub use synchronizer::{Synchronizer, SynchronizerOptions, SyncError, ProgressListener};
pub use adapters::{
    register_default_providers, EntityFetchProvider, DeliveryProvider, ResultSendProvider,
    RESOURCE_TYPES,
};
pub use history::{HistoryManager, SyncRunRecord, RunOutcome, HistoryStats, HistoryError};
pub use manager::{SyncManager, SyncResult, TypeProgressListener};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
