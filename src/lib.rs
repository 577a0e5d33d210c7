//! # Assessment Sync
//!
//! Offline-capable assessment client core: keeps locally cached test-takers,
//! deliveries, eligibilities and results in line with the assessment server.

pub mod cache;
pub mod config;
pub mod db;
pub mod sync;

use std::sync::Arc;

pub use cache::TokenCache;
pub use config::{ConfigError, Credentials, SyncConfig};
pub use db::{Database, DbError};

use sync::{
    register_default_providers, BackgroundScheduler, HistoryManager, ProviderRegistry, RegistryError,
    SchedulerError, SyncApiClient, SyncApiError, SyncManager, SyncResult, SynchronizerOptions,
    TypeProgressListener,
};

// ============================================================================
// Application Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Client error: {0}")]
    Client(#[from] SyncApiError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot determine a data directory, set ASSESSMENT_SYNC_DATABASE")]
    NoDataDirectory,

    #[error("{} resource type(s) failed to synchronize", .0.len())]
    Incomplete(Vec<String>),
}

// ============================================================================
// Application Entry Point
// ============================================================================

/// Build the engine from the environment and synchronize.
///
/// With an empty `requested` list every registered type is synchronized.
/// When a scheduler interval is configured, synchronization repeats in the
/// background until Ctrl-C.
pub async fn run(requested: Vec<String>) -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::from_env()?;

    let db_path = config.resolve_database_path().ok_or(AppError::NoDataDirectory)?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    log::info!("Database path: {:?}", db_path);
    let db = Arc::new(Database::new(db_path)?);

    let tokens = TokenCache::new();
    let api = Arc::new(SyncApiClient::from_config(&config, tokens.clone())?);

    let mut registry = ProviderRegistry::new();
    register_default_providers(&mut registry, db.clone(), api)?;

    for name in &requested {
        if !registry.contains(name) {
            return Err(RegistryError::NotRegistered(name.clone()).into());
        }
    }

    let progress: TypeProgressListener = Arc::new(|name: &str, value: f64| {
        log::debug!("{}: {:.0}%", name, value);
    });
    let manager = Arc::new(
        SyncManager::new(
            &registry,
            SynchronizerOptions {
                chunk_size: config.chunk_size,
            },
            Some(progress),
        )
        .with_history(HistoryManager::new(db.clone()))
        .with_history_retention(config.history_retention_days),
    );

    if config.sync_interval_minutes > 0 {
        let scheduler = BackgroundScheduler::new(db.clone());
        scheduler.load_config().await?;
        scheduler
            .update_config(true, config.sync_interval_minutes, manager.clone())
            .await?;

        tokio::signal::ctrl_c().await?;
        log::info!("Shutting down");

        manager.stop_all();
        scheduler.stop().await?;
        log_token_stats(&tokens);
        return Ok(());
    }

    let result = if requested.is_empty() {
        manager.sync_all().await
    } else {
        manager.sync_types(&requested).await
    };

    print_summary(&result);
    log_token_stats(&tokens);

    if result.is_success() {
        Ok(())
    } else {
        Err(AppError::Incomplete(result.errors))
    }
}

fn log_token_stats(tokens: &TokenCache) {
    let stats = tokens.stats();
    log::info!(
        "Token cache: {} lookup(s), {} hit(s), {} miss(es)",
        stats.total_requests,
        stats.hits,
        stats.misses
    );
}

fn print_summary(result: &SyncResult) {
    for (name, report) in &result.reports {
        println!("{:<12} {:<5} {} change(s)", name, report.direction().as_str(), report.changes());
    }
    for name in &result.canceled {
        println!("{:<12} canceled", name);
    }
    for error in &result.errors {
        println!("error: {}", error);
    }
}
