//! Bounded, TTL-aware cache of evaluation results.
//!
//! Capacity is enforced in bytes (estimated from serialized size), not entry
//! count: `set` evicts repeatedly under the configured policy until the new
//! entry fits. Expired entries are treated identically to absent entries and
//! removed on read. All statistics are derived from counters updated inline
//! on every operation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{CacheConfig, EvictionPolicy};
use crate::model::{ConstraintDefinition, EvaluationResult, Schedule};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },
    #[error("failed to estimate entry size: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Deterministic cache key for a constraint/schedule pair.
///
/// Uses the constraint's custom key when declared, otherwise
/// `constraint_id:schedule_id:version_token` so that any schedule update
/// naturally misses.
pub fn cache_key(definition: &ConstraintDefinition, schedule: &Schedule) -> String {
    match &definition.custom_cache_key {
        Some(key) => key.clone(),
        None => format!(
            "{}:{}:{}",
            definition.id,
            schedule.id,
            schedule.version_token()
        ),
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: EvaluationResult,
    created_at: Instant,
    last_accessed: Instant,
    hit_count: u64,
    size_bytes: usize,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first. Used by FIFO.
    insertion_order: VecDeque<String>,
    /// Access order, least recent first. Used by LRU.
    access_order: VecDeque<String>,
    current_size: usize,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            self.access_order.remove(pos);
        }
        self.access_order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.current_size -= entry.size_bytes;
        if let Some(pos) = self.insertion_order.iter().position(|k| k == key) {
            self.insertion_order.remove(pos);
        }
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            self.access_order.remove(pos);
        }
        Some(entry)
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub size_bytes: usize,
    pub avg_entry_size: usize,
    pub avg_get_latency: Duration,
}

/// Shared result cache. Safe under concurrent `get`/`set`/`delete`;
/// per-key atomicity only, cross-key operations make no atomicity claim.
pub struct ResultCache {
    config: CacheConfig,
    inner: RwLock<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    get_count: AtomicU64,
    get_nanos: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            get_nanos: AtomicU64::new(0),
        }
    }

    /// Looks up a fresh entry. An expired entry is removed and counted as a
    /// miss.
    pub async fn get(&self, key: &str) -> Option<EvaluationResult> {
        let started = Instant::now();
        let result = self.get_inner(key).await;
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        result
    }

    async fn get_inner(&self, key: &str) -> Option<EvaluationResult> {
        let mut inner = self.inner.write().await;
        let expired = match inner.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.created_at.elapsed() > self.config.ttl,
        };
        if expired {
            inner.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        inner.touch(key);
        let value = inner.entries.get_mut(key).map(|entry| {
            entry.last_accessed = Instant::now();
            entry.hit_count += 1;
            entry.value.clone()
        });
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Inserts a value, evicting under the configured policy until it fits.
    pub async fn set(&self, key: &str, value: EvaluationResult) -> CacheResult<()> {
        let size_bytes = serde_json::to_vec(&value)?.len();
        if size_bytes > self.config.max_size_bytes {
            return Err(CacheError::EntryTooLarge {
                size: size_bytes,
                capacity: self.config.max_size_bytes,
            });
        }

        let mut inner = self.inner.write().await;
        inner.remove(key);
        while inner.current_size + size_bytes > self.config.max_size_bytes {
            match self.pick_victim(&inner) {
                Some(victim) => {
                    debug!(key = %victim, policy = %self.config.eviction_policy, "evicting cache entry");
                    inner.remove(&victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        let now = Instant::now();
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
                hit_count: 0,
                size_bytes,
            },
        );
        inner.current_size += size_bytes;
        inner.insertion_order.push_back(key.to_string());
        inner.access_order.push_back(key.to_string());
        Ok(())
    }

    fn pick_victim(&self, inner: &CacheInner) -> Option<String> {
        match self.config.eviction_policy {
            EvictionPolicy::Lru => inner.access_order.front().cloned(),
            EvictionPolicy::Fifo => inner.insertion_order.front().cloned(),
            EvictionPolicy::Lfu => inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.hit_count)
                .map(|(key, _)| key.clone()),
            EvictionPolicy::Adaptive => inner
                .entries
                .iter()
                .map(|(key, entry)| {
                    let age_ms = entry.created_at.elapsed().as_millis() as f64;
                    let recency_ms = entry.last_accessed.elapsed().as_millis() as f64;
                    let score = entry.hit_count as f64 * self.config.adaptive_frequency_weight
                        / (age_ms + recency_ms + 1.0);
                    (key, score)
                })
                .min_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(key, _)| key.clone()),
        }
    }

    /// Whether a fresh entry exists. Removes the entry when expired.
    pub async fn has(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.get(key) {
            None => false,
            Some(entry) if entry.created_at.elapsed() > self.config.ttl => {
                inner.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(_) => true,
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.write().await.remove(key).is_some()
    }

    /// Removes every key matching `pattern` (regex when it compiles,
    /// literal substring otherwise) and returns the count removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let matcher: Box<dyn Fn(&str) -> bool> = match Regex::new(pattern) {
            Ok(re) => Box::new(move |key: &str| re.is_match(key)),
            Err(_) => {
                let literal = pattern.to_string();
                Box::new(move |key: &str| key.contains(&literal))
            }
        };
        let mut inner = self.inner.write().await;
        let victims: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| matcher(key))
            .cloned()
            .collect();
        for key in &victims {
            inner.remove(key);
        }
        victims.len()
    }

    /// Semantically equivalent to repeated `get` calls.
    pub async fn get_batch(&self, keys: &[String]) -> Vec<Option<EvaluationResult>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await);
        }
        results
    }

    /// Semantically equivalent to repeated `set` calls; stops at the first
    /// error.
    pub async fn set_batch(
        &self,
        entries: Vec<(String, EvaluationResult)>,
    ) -> CacheResult<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = CacheInner::default();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    pub async fn current_size_bytes(&self) -> usize {
        self.inner.read().await.current_size
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let get_count = self.get_count.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries: inner.entries.len(),
            size_bytes: inner.current_size,
            avg_entry_size: if inner.entries.is_empty() {
                0
            } else {
                inner.current_size / inner.entries.len()
            },
            avg_get_latency: if get_count == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(self.get_nanos.load(Ordering::Relaxed) / get_count)
            },
        }
    }
}
