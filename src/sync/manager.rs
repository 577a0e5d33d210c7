//! Sync Manager - orchestrates the synchronizers of every resource type
//!
//! Owns one `Synchronizer` per registered provider, runs them one type at a
//! time, records each run in the history table and exposes a single stop
//! switch for all of them.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::history::{HistoryManager, SyncRunRecord};
use super::models::SyncReport;
use super::provider::{ProviderRegistry, RegistryError};
use super::synchronizer::{SyncError, Synchronizer, SynchronizerOptions};

/// Progress callback receiving the resource type and its percentage
pub type TypeProgressListener = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Outcome of synchronizing several resource types
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Completed runs, in execution order
    pub reports: Vec<(String, SyncReport)>,
    /// Types whose run was canceled or skipped after a stop
    pub canceled: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total number of ids touched across all runs
    pub fn changes(&self) -> usize {
        self.reports.iter().map(|(_, report)| report.changes()).sum()
    }
}

pub struct SyncManager {
    synchronizers: HashMap<String, Arc<Synchronizer>>,
    order: Vec<String>,
    history: Option<HistoryManager>,
    retention_days: Option<i64>,
    cancel: Mutex<CancellationToken>,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
}

impl SyncManager {
    /// One synchronizer per registered provider
    pub fn new(
        registry: &ProviderRegistry,
        options: SynchronizerOptions,
        listener: Option<TypeProgressListener>,
    ) -> Self {
        let mut synchronizers = HashMap::new();

        for name in registry.names() {
            let provider = match registry.get(name) {
                Ok(provider) => provider,
                Err(e) => {
                    log::error!("Skipping provider {}: {}", name, e);
                    continue;
                }
            };

            let mut synchronizer = Synchronizer::new(name.clone(), provider, options.clone());
            if let Some(listener) = &listener {
                let listener = listener.clone();
                let type_name = name.clone();
                synchronizer = synchronizer.with_progress_listener(move |value| listener(&type_name, value));
            }

            synchronizers.insert(name.clone(), Arc::new(synchronizer));
        }

        Self {
            synchronizers,
            order: registry.names().to_vec(),
            history: None,
            retention_days: None,
            cancel: Mutex::new(CancellationToken::new()),
            last_sync_at: RwLock::new(None),
        }
    }

    /// Record every run through the given history manager
    pub fn with_history(mut self, history: HistoryManager) -> Self {
        self.history = Some(history);
        self
    }

    /// Drop history older than `days` after every sync; 0 keeps everything
    pub fn with_history_retention(mut self, days: u32) -> Self {
        self.retention_days = (days > 0).then_some(i64::from(days));
        self
    }

    pub fn resource_types(&self) -> &[String] {
        &self.order
    }

    pub fn synchronizer(&self, name: &str) -> Result<Arc<Synchronizer>, RegistryError> {
        self.synchronizers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    /// Whether any resource type is synchronizing right now
    pub fn is_running(&self) -> bool {
        self.synchronizers.values().any(|s| s.is_running())
    }

    pub async fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.read().await
    }

    /// Synchronize one resource type
    pub async fn synchronize(&self, name: &str) -> Result<SyncReport, SyncError> {
        let parent = self.current_token();
        self.run(name, &parent).await
    }

    /// Synchronize every registered type, in registration order
    pub async fn sync_all(&self) -> SyncResult {
        let names = self.order.clone();
        self.sync_types(&names).await
    }

    /// Synchronize the given types one after another.
    ///
    /// A failing type does not prevent the others from running; a stop skips
    /// everything not yet started.
    pub async fn sync_types(&self, names: &[String]) -> SyncResult {
        let parent = self.current_token();
        let mut result = SyncResult::default();

        for name in names {
            if parent.is_cancelled() {
                log::info!("Skipping {} synchronization, sync was stopped", name);
                result.canceled.push(name.clone());
                continue;
            }

            match self.run(name, &parent).await {
                Ok(report) => result.reports.push((name.clone(), report)),
                Err(e) if e.is_canceled() => result.canceled.push(name.clone()),
                Err(e) => result.errors.push(format!("{}: {}", name, e)),
            }
        }

        if !result.reports.is_empty() {
            *self.last_sync_at.write().await = Some(Utc::now());
        }

        self.prune_history();

        log::info!(
            "Synchronized {} type(s): {} change(s), {} canceled, {} error(s)",
            result.reports.len(),
            result.changes(),
            result.canceled.len(),
            result.errors.len()
        );

        result
    }

    /// Stop every running synchronizer.
    ///
    /// Runs started afterwards are unaffected.
    pub fn stop_all(&self) {
        let mut cancel = self.lock_cancel();
        cancel.cancel();
        *cancel = CancellationToken::new();
        log::info!("Stop requested for all synchronizations");
    }

    async fn run(&self, name: &str, parent: &CancellationToken) -> Result<SyncReport, SyncError> {
        let synchronizer = self.synchronizer(name)?;
        let started_at = Utc::now();

        let result = synchronizer.start_with(parent).await;

        // A rejected concurrent start is not a run of its own
        if matches!(result, Err(SyncError::AlreadyRunning(_))) {
            return result;
        }

        if let Some(history) = &self.history {
            let run = SyncRunRecord::from_result(name, synchronizer.provider().direction(), started_at, &result);
            if let Err(e) = history.record(&run) {
                log::warn!("Failed to record {} sync history: {}", name, e);
            }
        }

        result
    }

    fn prune_history(&self) {
        let (Some(history), Some(days)) = (&self.history, self.retention_days) else {
            return;
        };

        if let Err(e) = history.enforce_retention_policy(days) {
            log::warn!("Failed to apply sync history retention: {}", e);
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.lock_cancel().clone()
    }

    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::models::{resource_map, Direction, ResourceMap, ResourceRecord};
    use crate::sync::provider::{FetchProvider, Provider, ProviderError};
    use async_trait::async_trait;

    struct StaticProvider {
        remote: ResourceMap,
        fail: bool,
    }

    #[async_trait]
    impl FetchProvider for StaticProvider {
        async fn get_remote_resource_ids(&self) -> Result<ResourceMap, ProviderError> {
            if self.fail {
                return Err(ProviderError::Other("server unreachable".into()));
            }
            Ok(self.remote.clone())
        }

        async fn get_remote_resources(&self, ids: &[String]) -> Result<ResourceMap, ProviderError> {
            Ok(ids.iter().filter_map(|id| self.remote.get(id).cloned()).map(|r| (r.id.clone(), r)).collect())
        }

        async fn get_local_resources(&self) -> Result<ResourceMap, ProviderError> {
            Ok(ResourceMap::new())
        }

        async fn add_resource(&self, _record: ResourceRecord) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn update_resource(&self, _record: ResourceRecord) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn remove_resource(&self, _id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register(
                "test-taker",
                Provider::fetch(StaticProvider {
                    remote: resource_map([ResourceRecord::new("tt-1", "a")]),
                    fail: false,
                }),
            )
            .unwrap();
        registry
            .register("delivery", Provider::fetch(StaticProvider { remote: ResourceMap::new(), fail: true }))
            .unwrap();
        registry
    }

    fn manager() -> (SyncManager, HistoryManager) {
        let history = HistoryManager::new(Arc::new(Database::in_memory().unwrap()));
        let manager = SyncManager::new(&registry(), SynchronizerOptions::default(), None).with_history(history.clone());
        (manager, history)
    }

    #[tokio::test]
    async fn test_sync_all_collects_errors_and_history() {
        let (manager, history) = manager();

        let result = manager.sync_all().await;

        assert_eq!(result.reports.len(), 1);
        assert_eq!(result.reports[0].0, "test-taker");
        assert_eq!(result.changes(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("delivery:"));
        assert!(!result.is_success());

        assert_eq!(history.get_stats().unwrap().total_runs, 2);
        assert!(history.last_successful("test-taker").unwrap().is_some());
        assert!(history.last_successful("delivery").unwrap().is_none());
        assert!(manager.last_sync_at().await.is_some());
    }

    #[tokio::test]
    async fn test_sync_all_applies_history_retention() {
        let history = HistoryManager::new(Arc::new(Database::in_memory().unwrap()));
        let manager = SyncManager::new(&registry(), SynchronizerOptions::default(), None)
            .with_history(history.clone())
            .with_history_retention(30);

        let ok: Result<SyncReport, SyncError> = Ok(SyncReport::Fetch(Default::default()));
        let mut old = SyncRunRecord::from_result("test-taker", Direction::Fetch, Utc::now(), &ok);
        old.finished_at = Utc::now() - chrono::Duration::days(45);
        old.started_at = old.finished_at;
        history.record(&old).unwrap();

        manager.sync_all().await;

        let runs = history.get_history("test-taker", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].finished_at > Utc::now() - chrono::Duration::days(1));
        assert_eq!(history.get_stats().unwrap().total_runs, 2);
    }

    #[tokio::test]
    async fn test_history_is_kept_without_retention() {
        let (manager, history) = manager();

        let ok: Result<SyncReport, SyncError> = Ok(SyncReport::Fetch(Default::default()));
        let mut old = SyncRunRecord::from_result("test-taker", Direction::Fetch, Utc::now(), &ok);
        old.finished_at = Utc::now() - chrono::Duration::days(400);
        history.record(&old).unwrap();

        manager.sync_all().await;

        assert_eq!(history.get_stats().unwrap().total_runs, 3);
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let (manager, _) = manager();
        let err = manager.synchronize("eligibility").await.unwrap_err();
        assert!(matches!(err, SyncError::Registry(RegistryError::NotRegistered(_))));
    }

    #[tokio::test]
    async fn test_stop_all_only_affects_current_runs() {
        let (manager, _) = manager();
        manager.stop_all();

        // The token was replaced, so a new run proceeds normally
        assert!(manager.synchronize("test-taker").await.is_ok());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_progress_listener_gets_type_name() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: TypeProgressListener = Arc::new(move |name: &str, value: f64| {
            sink.lock().unwrap().push((name.to_string(), value));
        });
        let manager = SyncManager::new(&registry(), SynchronizerOptions::default(), Some(listener));

        manager.synchronize("test-taker").await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|(name, _)| name == "test-taker"));
        assert_eq!(seen.last().map(|(_, v)| *v), Some(100.0));
    }
}
