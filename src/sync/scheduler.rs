//! Background Sync Scheduler
//!
//! Runs "synchronize all" periodically at a configurable interval.
//! Uses Tokio tasks for non-blocking background execution.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::manager::SyncManager;
use crate::db::{Database, DbError};

const CONFIG_KEY: &str = "scheduler_config";
const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<String>, // RFC 3339 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl BackgroundScheduler {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self.db.get_setting(CONFIG_KEY)?.unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db.set_setting(CONFIG_KEY, &config)?;
        Ok(())
    }

    /// Start the background task
    pub async fn start(&self, manager: Arc<SyncManager>) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let handle = tokio::spawn(Self::scheduler_loop(
            self.running.clone(),
            self.db.clone(),
            self.config.clone(),
            manager,
        ));

        *self.lock_handle() = Some(handle);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop the background task; a sync in progress is aborted with it
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.lock_handle().take() {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u64,
        manager: Arc<SyncManager>,
    ) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start(manager).await?;
        }

        log::info!("Scheduler config updated: enabled={}, interval={} minutes", enabled, interval_minutes);
        Ok(())
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task_handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        manager: Arc<SyncManager>,
    ) {
        let interval_minutes = config.read().await.interval_minutes;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60 * interval_minutes));

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            if manager.is_running() {
                log::warn!("Previous sync still in progress, skipping scheduled sync");
                continue;
            }

            log::info!("Background sync triggered by scheduler");

            let result = manager.sync_all().await;
            if !result.errors.is_empty() {
                log::warn!("Background sync had {} errors: {:?}", result.errors.len(), result.errors);
            }

            let snapshot = {
                let mut cfg = config.write().await;
                cfg.last_run = Some(Utc::now().to_rfc3339());
                cfg.clone()
            };

            if let Err(e) = db.set_setting(CONFIG_KEY, &snapshot) {
                log::error!("Failed to save last_run timestamp: {}", e);
            }
        }

        log::info!("Scheduler loop exited");
    }
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
