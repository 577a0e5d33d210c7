//! Token cache module - in-memory bearer token storage
//!
//! Provides the credential cache injected into the token service:
//! - One token per credential key
//! - Single-flight initialization: concurrent misses on the same key share
//!   one pending token request
//! - Never persisted; lives as long as the owning client

use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::sync::models::Token;

/// Token cache configuration
pub struct TokenCacheConfig {
    /// Maximum number of credential keys to keep
    pub max_capacity: u64,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 64,
        }
    }
}

/// Bearer tokens keyed by credential
#[derive(Clone)]
pub struct TokenCache {
    cache: Arc<Cache<String, Token>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl TokenCache {
    /// Create a new token cache with default configuration
    pub fn new() -> Self {
        Self::with_config(TokenCacheConfig::default())
    }

    /// Create a new token cache with custom configuration
    pub fn with_config(config: TokenCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .build();

        Self {
            cache: Arc::new(cache),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get a cached token
    pub async fn get(&self, key: &str) -> Option<Token> {
        match self.cache.get(key).await {
            Some(token) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(token)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return the cached token, or run `init` to obtain one.
    ///
    /// While `init` is pending, other callers for the same key wait for its
    /// result instead of starting their own request. A failed `init` caches
    /// nothing; the error is shared with every waiter.
    pub async fn get_or_try_insert_with<F, E>(&self, key: &str, init: F) -> Result<Token, Arc<E>>
    where
        F: Future<Output = Result<Token, E>>,
        E: Send + Sync + 'static,
    {
        let entry = self
            .cache
            .entry(key.to_string())
            .or_try_insert_with(init)
            .await?;

        if entry.is_fresh() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        Ok(entry.into_value())
    }

    /// Insert or replace a token
    pub async fn insert(&self, key: &str, token: Token) {
        self.cache.insert(key.to_string(), token).await;
    }

    /// Drop the token of one key
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Drop the token of one key if it is still `stale`.
    ///
    /// A token stored by another caller in the meantime is left alone.
    /// Returns whether an entry was removed.
    pub async fn invalidate_if(&self, key: &str, stale: &Token) -> bool {
        let stale = stale.clone();
        let result = self
            .cache
            .entry(key.to_string())
            .and_compute_with(|entry| async move {
                match entry {
                    Some(entry) if *entry.value() == stale => Op::Remove,
                    _ => Op::Nop,
                }
            })
            .await;

        matches!(result, CompResult::Removed(_))
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        CacheStats {
            hits,
            misses,
            total_requests: hits + misses,
            entry_count: self.cache.entry_count(),
        }
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Total cache requests
    pub total_requests: u64,

    /// Number of entries in cache (approximate until pending tasks run)
    pub entry_count: u64,
}
