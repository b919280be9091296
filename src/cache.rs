//! In-process cache of chunk refinements.
//!
//! Bounded LRU with a per-entry time-to-live. Keys are SHA-256 digests of the
//! model, prompt, and system instructions, so identical requests within one
//! process reuse the earlier fragment instead of calling the backend again.

use crate::config::CacheConfig;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Cache key for one completion request.
pub fn cache_key(model: &str, prompt: &str, system: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}|{}", model, prompt, system).as_bytes());
    format!("{:x}", digest)
}

/// Snapshot of the cache contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

/// Thread-safe LRU cache with TTL.
#[derive(Clone)]
pub struct RefineCache {
    inner: Cache<String, String>,
    max_size: usize,
}

impl RefineCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_size as u64)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { inner, max_size }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, Duration::from_millis(config.ttl_ms))
    }

    /// Returns a live entry and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    /// Stores a value, evicting the least recently used entries over capacity.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        if self.max_size == 0 {
            return;
        }
        self.inner.insert(key.into(), value.into());
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.inner.run_pending_tasks();
        self.inner.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks();
        let total = self.inner.entry_count() as usize;
        // Iteration skips entries past their time-to-live.
        let valid = self.inner.iter().count().min(total);
        CacheStats {
            total,
            valid,
            expired: total - valid,
        }
    }
}
