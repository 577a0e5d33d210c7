//! Synchronizer - runs one provider through a fetch or send workflow
//!
//! Fetch: local + remote listing (concurrently) → diff → removes → update
//! chunks → add chunks. Chunks of one phase are dispatched together; the
//! first failing chunk fails the run.
//!
//! Send: every local record is pushed, and removed locally once accepted.
//!
//! Cancellation is cooperative: `stop()` cancels the run's token, which is
//! checked between phases. Calls already in flight always complete.

use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::diff::{chunk_ids, compute_needed_operations};
use super::models::{FetchOperations, SendOperations, SyncReport};
use super::provider::{FetchProvider, Provider, ProviderError, RegistryError, SendProvider};

/// Weight of the two listing calls made before the real workload is known
const PRIMING_UNITS: usize = 2;

const DEFAULT_CHUNK_SIZE: usize = 100;

/// Receives progress percentages (0-100, non-decreasing within a run)
pub type ProgressListener = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Synchronization of '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Synchronization canceled")]
    Canceled,

    #[error("Provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl SyncError {
    /// Canceled runs are a user decision, not a failure
    pub fn is_canceled(&self) -> bool {
        matches!(self, SyncError::Canceled)
    }
}

#[derive(Debug, Clone)]
pub struct SynchronizerOptions {
    /// Maximum ids per content request
    pub chunk_size: usize,
}

impl Default for SynchronizerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone, Copy)]
enum ApplyMode {
    Add,
    Update,
}

/// Facade driving one provider
pub struct Synchronizer {
    name: String,
    provider: Provider,
    options: SynchronizerOptions,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    initialized: OnceCell<()>,
    listener: Option<ProgressListener>,
}

impl Synchronizer {
    pub fn new(name: impl Into<String>, provider: Provider, options: SynchronizerOptions) -> Self {
        Self {
            name: name.into(),
            provider,
            options,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            initialized: OnceCell::new(),
            listener: None,
        }
    }

    /// Attach a progress listener
    pub fn with_progress_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the current run has been asked to stop
    pub fn is_canceled(&self) -> bool {
        self.lock_cancel()
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Ask the current run to stop at its next checkpoint.
    ///
    /// Returns `false` when nothing is running.
    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        match self.lock_cancel().as_ref() {
            Some(token) => {
                log::info!("Stopping synchronization of {}", self.name);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one synchronization
    pub async fn start(&self) -> Result<SyncReport, SyncError> {
        self.start_with(&CancellationToken::new()).await
    }

    /// Run one synchronization that also stops when `parent` is canceled
    pub async fn start_with(&self, parent: &CancellationToken) -> Result<SyncReport, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning(self.name.clone()));
        }

        let token = parent.child_token();
        *self.lock_cancel() = Some(token.clone());
        let _guard = RunGuard { synchronizer: self };

        let progress = Progress::new(self.listener.clone());
        progress.emit(0.0);

        log::info!(
            "Starting {} synchronization of {}",
            self.provider.direction().as_str(),
            self.name
        );

        self.initialized
            .get_or_try_init(|| self.provider.init())
            .await?;

        let result = match &self.provider {
            Provider::Fetch(provider) => self
                .run_fetch(provider.as_ref(), &token, &progress)
                .await
                .map(SyncReport::Fetch),
            Provider::Send(provider) => self
                .run_send(provider.as_ref(), &token, &progress)
                .await
                .map(SyncReport::Send),
        };

        match &result {
            Ok(report) => {
                progress.emit(100.0);
                log::info!("Synchronization of {} completed ({} changes)", self.name, report.changes());
            }
            Err(e) if e.is_canceled() => log::info!("Synchronization of {} canceled", self.name),
            Err(e) => log::error!("Synchronization of {} failed: {}", self.name, e),
        }

        result
    }

    async fn run_fetch(
        &self,
        provider: &dyn FetchProvider,
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> Result<FetchOperations, SyncError> {
        let (local, remote) = tokio::try_join!(
            provider.get_local_resources(),
            provider.get_remote_resource_ids(),
        )?;
        checkpoint(cancel)?;

        let operations = compute_needed_operations(&local, &remote);
        log::info!(
            "{}: {} local, {} remote, {} to add, {} to update, {} to remove",
            self.name,
            local.len(),
            remote.len(),
            operations.add.len(),
            operations.update.len(),
            operations.remove.len()
        );

        let update_chunks = chunk_ids(&operations.update, self.options.chunk_size);
        let add_chunks = chunk_ids(&operations.add, self.options.chunk_size);
        // The listings are only credited once the real total is known
        progress.set_total(PRIMING_UNITS + operations.len() + update_chunks.len() + add_chunks.len());
        progress.advance(PRIMING_UNITS);

        try_join_all(operations.remove.iter().map(|id| async move {
            provider.remove_resource(id).await?;
            progress.advance(1);
            Ok::<_, ProviderError>(())
        }))
        .await?;
        checkpoint(cancel)?;

        apply_chunks(provider, update_chunks, ApplyMode::Update, progress).await?;
        checkpoint(cancel)?;

        apply_chunks(provider, add_chunks, ApplyMode::Add, progress).await?;
        checkpoint(cancel)?;

        Ok(operations)
    }

    async fn run_send(
        &self,
        provider: &dyn SendProvider,
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> Result<SendOperations, SyncError> {
        let local = provider.get_local_resources().await?;
        checkpoint(cancel)?;

        let total = local.len();
        log::info!("{}: {} record(s) to send", self.name, total);

        let mut operations = SendOperations::default();
        for (index, record) in local.values().enumerate() {
            checkpoint(cancel)?;

            if provider.send_resource(record).await? {
                operations.send.push(record.id.clone());
                provider.remove_resource(&record.id).await?;
                operations.remove.push(record.id.clone());
            } else {
                log::warn!("{} {} was not accepted, keeping it locally", self.name, record.id);
            }

            progress.emit((index + 1) as f64 / total as f64 * 100.0);
        }

        Ok(operations)
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fetch each chunk's records and apply them; all chunks run concurrently
async fn apply_chunks(
    provider: &dyn FetchProvider,
    chunks: Vec<Vec<String>>,
    mode: ApplyMode,
    progress: &Progress,
) -> Result<(), ProviderError> {
    try_join_all(chunks.into_iter().map(|chunk| async move {
        let records = provider.get_remote_resources(&chunk).await?;
        progress.advance(1);

        for (_, record) in records {
            match mode {
                ApplyMode::Add => provider.add_resource(record).await?,
                ApplyMode::Update => provider.update_resource(record).await?,
            }
            progress.advance(1);
        }

        Ok::<_, ProviderError>(())
    }))
    .await?;

    Ok(())
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        Err(SyncError::Canceled)
    } else {
        Ok(())
    }
}

/// Resets the run flags however the run ends
struct RunGuard<'a> {
    synchronizer: &'a Synchronizer,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.synchronizer.lock_cancel().take();
        self.synchronizer.running.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Progress
// ============================================================================

struct ProgressState {
    done: usize,
    total: usize,
    last: f64,
}

/// Completed units over the estimated total, clamped and never decreasing
struct Progress {
    listener: Option<ProgressListener>,
    state: Mutex<ProgressState>,
}

impl Progress {
    fn new(listener: Option<ProgressListener>) -> Self {
        Self {
            listener,
            state: Mutex::new(ProgressState {
                done: 0,
                total: 0,
                last: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_total(&self, total: usize) {
        self.lock().total = total;
    }

    fn advance(&self, units: usize) {
        let mut state = self.lock();
        state.done += units;
        let value = if state.total == 0 {
            0.0
        } else {
            state.done as f64 / state.total as f64 * 100.0
        };
        self.publish(&mut state, value);
    }

    fn emit(&self, value: f64) {
        let mut state = self.lock();
        self.publish(&mut state, value);
    }

    // Runs under the state lock so listeners observe values in order
    fn publish(&self, state: &mut ProgressState, value: f64) {
        let value = value.clamp(0.0, 100.0).max(state.last);
        state.last = value;
        if let Some(listener) = &self.listener {
            listener(value);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
